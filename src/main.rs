mod bundler;
mod config;
mod encoding;
mod erc20;
mod jsonrpc;
mod paymaster;
mod types;

use anyhow::{anyhow, bail, Context, Result};
use bundler::BundlerClient;
use clap::{Args, Parser, Subcommand};
use config::load_deployment;
use erc20::Erc20;
use ethers::abi::{Abi, AbiParser};
use ethers::prelude::*;
use ethers::providers::Middleware;
use paymaster::TokenPaymasterClient;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use types::UserOperation;

#[derive(Parser, Debug)]
#[command(name = "tokensend-aa", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual smart account address (and deployment status).
    Account(AccountArgs),

    /// Print the smart account's token balance.
    Balance(BalanceArgs),

    /// Transfer tokens from the smart account, paying gas in the token itself.
    Transfer(TransferArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Deployment artifact (chain + token).
    #[arg(long, default_value = "deployments/base-sepolia.json")]
    deployment: PathBuf,

    /// Override the chain RPC URL (otherwise uses deployment JSON).
    #[arg(long, env = "TOKENSEND_AA_RPC_URL")]
    rpc: Option<String>,

    /// EntryPoint address.
    #[arg(long, env = "TOKENSEND_AA_ENTRYPOINT")]
    entrypoint: String,

    /// SimpleAccountFactory address.
    #[arg(long, env = "TOKENSEND_AA_FACTORY")]
    factory: String,

    /// Smart account owner private key.
    ///
    /// Recommended: set via env var TOKENSEND_AA_OWNER_PRIVATE_KEY.
    #[arg(long, env = "TOKENSEND_AA_OWNER_PRIVATE_KEY")]
    owner_private_key: Option<String>,

    /// Generate a new random owner key and write it under .secrets/ locally.
    ///
    /// The private key is never printed; it is saved to a local env file that
    /// should be gitignored.
    #[arg(long, default_value_t = false)]
    new_owner: bool,

    /// CREATE2 salt for the smart account.
    #[arg(long, default_value_t = 0)]
    salt: u64,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Print a single JSON object `{ "owner": ..., "smartAccount": ..., "deployed": ... }`
    /// to stdout instead of the human-readable listing.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct BalanceArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct TransferArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Recipient address.
    #[arg(long)]
    recipient: String,

    /// Amount to transfer, in human units of the token (e.g. "1.5").
    #[arg(long)]
    amount: String,

    /// Bundler RPC URL (must support ERC-4337 JSON-RPC methods).
    #[arg(long, env = "TOKENSEND_AA_BUNDLER_URL")]
    bundler: String,

    /// Token paymaster RPC URL (fee quotes + sponsorship).
    #[arg(long, env = "TOKENSEND_AA_PAYMASTER_URL")]
    paymaster: String,

    /// Gas price multiplier in basis points (e.g. 15000 = 1.5x).
    ///
    /// Applied to maxFeePerGas and maxPriorityFeePerGas.
    #[arg(long, default_value_t = 10000, env = "TOKENSEND_AA_GAS_MULTIPLIER_BPS")]
    gas_multiplier_bps: u64,

    /// Do not send the UserOperation; only build, quote and sponsor.
    #[arg(long)]
    dry_run: bool,

    /// Do not wait for the userOp receipt.
    #[arg(long)]
    no_wait: bool,

    /// Max seconds to wait for the userOp receipt. Use 0 to disable timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Logs go to stderr so stdout stays machine-parseable.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Balance(args) => cmd_balance(args).await,
        Command::Transfer(args) => cmd_transfer(args).await,
    }
}

/// Resolved chain context shared by every command.
struct Chain {
    dep: config::Deployment,
    provider: Arc<Provider<Http>>,
    chain_id: u64,
    entrypoint: Address,
    factory: Address,
}

async fn connect(common: &CommonArgs) -> Result<Chain> {
    let dep = load_deployment(&common.deployment, common.rpc.clone())?;

    let provider =
        Provider::<Http>::try_from(dep.rpc_url.as_str())?.interval(Duration::from_millis(350));

    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != dep.chain_id {
        bail!(
            "chainId mismatch: deployment has {}, RPC returned {}",
            dep.chain_id,
            chain_id
        );
    }

    let entrypoint =
        Address::from_str(&common.entrypoint).context("invalid --entrypoint address")?;
    let factory = Address::from_str(&common.factory).context("invalid --factory address")?;

    Ok(Chain {
        dep,
        provider: Arc::new(provider),
        chain_id,
        entrypoint,
        factory,
    })
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let chain = connect(&args.common).await?;
    let (_wallet, owner) = load_or_generate_owner(&args.common, chain.chain_id)?;

    let (account, deployed) = compute_account_address(
        chain.provider.clone(),
        chain.factory,
        owner,
        U256::from(args.common.salt),
    )
    .await?;

    if args.json {
        let out = serde_json::json!({
            "owner": encoding::fmt_address(owner),
            "smartAccount": encoding::fmt_address(account),
            "deployed": deployed,
        });
        println!("{}", out);
        return Ok(());
    }

    println!("chainId:      {}", chain.chain_id);
    println!("entryPoint:   {}", chain.entrypoint);
    println!("factory:      {}", chain.factory);
    println!("owner:        {}", owner);
    println!("smartAccount: {}", account);
    println!("isDeployed:   {}", deployed);

    Ok(())
}

async fn cmd_balance(args: BalanceArgs) -> Result<()> {
    let chain = connect(&args.common).await?;
    let (_wallet, owner) = load_or_generate_owner(&args.common, chain.chain_id)?;

    let (account, _deployed) = compute_account_address(
        chain.provider.clone(),
        chain.factory,
        owner,
        U256::from(args.common.salt),
    )
    .await?;

    let token = Erc20::new(chain.dep.token, chain.provider.clone());
    let decimals = token
        .decimals()
        .call()
        .await
        .context("token decimals read failed")?;
    let symbol = token
        .symbol()
        .call()
        .await
        .unwrap_or_else(|_| "TOKEN".to_string());
    let balance = token
        .balance_of(account)
        .call()
        .await
        .context("token balanceOf read failed")?;

    let formatted = ethers::utils::format_units(balance, u32::from(decimals))
        .context("failed to format token balance")?;
    println!("{} {} (raw {})", formatted, symbol, balance);

    Ok(())
}

async fn cmd_transfer(args: TransferArgs) -> Result<()> {
    let chain = connect(&args.common).await?;
    let (wallet, owner) = load_or_generate_owner(&args.common, chain.chain_id)?;

    let recipient =
        Address::from_str(&args.recipient).context("invalid --recipient address")?;

    let salt = U256::from(args.common.salt);
    let (account, deployed) =
        compute_account_address(chain.provider.clone(), chain.factory, owner, salt).await?;
    tracing::info!(account = %account, deployed, "smart account resolved");

    // Token metadata drives the amount scaling; decimals always come from the
    // chain, the artifact value is only a cross-check.
    let token = Erc20::new(chain.dep.token, chain.provider.clone());
    let decimals = token
        .decimals()
        .call()
        .await
        .context("token decimals read failed")?;
    if let Some(expected) = chain.dep.decimals {
        if expected != decimals {
            tracing::warn!(
                artifact = expected,
                onchain = decimals,
                "deployment decimals disagree with the token contract; using on-chain value"
            );
        }
    }
    let symbol = token
        .symbol()
        .call()
        .await
        .unwrap_or_else(|_| "TOKEN".to_string());

    let amount_base = encoding::scale_amount(&args.amount, decimals)?;
    tracing::info!(amount = %args.amount, base_units = %amount_base, %symbol, "transfer amount scaled");

    let transfer_calldata = token
        .transfer(recipient, amount_base)
        .calldata()
        .ok_or_else(|| anyhow!("failed to build transfer calldata"))?;

    let nonce = entrypoint_nonce(chain.provider.clone(), chain.entrypoint, account).await?;
    let init_code =
        build_init_code(chain.provider.clone(), chain.factory, owner, salt, deployed).await?;

    // Fee fields from the node's gas price, with optional headroom.
    let gas_price = chain
        .provider
        .get_gas_price()
        .await
        .context("failed to fetch gas price")?;
    let bps = args.gas_multiplier_bps.max(1);
    let max_priority_fee_per_gas = gas_price * U256::from(bps) / U256::from(10_000u64);
    let max_fee_per_gas = max_priority_fee_per_gas;

    let mut op = UserOperation {
        sender: account,
        nonce,
        init_code,
        call_data: execute_calldata(
            chain.provider.clone(),
            account,
            chain.dep.token,
            transfer_calldata.clone(),
        )?,
        // Zero gas fields until the bundler estimate; the paymaster can quote
        // off its own estimates in the meantime.
        call_gas_limit: U256::zero(),
        verification_gas_limit: U256::zero(),
        pre_verification_gas: U256::zero(),
        max_fee_per_gas,
        max_priority_fee_per_gas,
        paymaster_and_data: Bytes::from(Vec::new()),
        signature: Bytes::from(vec![0u8; 65]),
    };

    let bundler = BundlerClient::new(args.bundler.clone());
    let paymaster = TokenPaymasterClient::new(args.paymaster.clone());

    // First estimate covers the plain transfer; the batch below re-estimates.
    sign_userop(chain.provider.clone(), chain.entrypoint, &mut op, &wallet).await?;
    let est = bundler
        .estimate_user_operation_gas(op.to_rpc_json(), chain.entrypoint)
        .await
        .context("bundler gas estimate failed")?;
    op.call_gas_limit = est.call_gas_limit;
    op.verification_gas_limit = est.verification_gas_limit;
    op.pre_verification_gas = est.pre_verification_gas;

    tracing::info!("requesting ERC-20 fee quotes (pm_getFeeQuoteOrData)...");
    let fee_quotes = paymaster
        .get_fee_quotes(op.to_rpc_json(), chain.dep.token)
        .await
        .context("paymaster fee quote request failed")?;

    // Never submit without a quote; the first entry wins.
    let quote = fee_quotes
        .quotes
        .first()
        .ok_or_else(|| anyhow!("paymaster returned no fee quote in {symbol}"))?;
    if quote.token_address != chain.dep.token {
        tracing::warn!(
            quoted = %quote.token_address,
            configured = %chain.dep.token,
            "first fee quote is not for the configured token"
        );
    }
    tracing::info!(
        symbol = %quote.symbol,
        decimals = quote.decimals,
        max_gas_fee = quote.max_gas_fee,
        premium_pct = quote.premium_percentage,
        valid_until = quote.valid_until,
        "fee quote selected"
    );

    let spender = fee_quotes
        .token_paymaster_address
        .ok_or_else(|| anyhow!("paymaster response missing tokenPaymasterAddress"))?;

    // Rebuild the call as approve(spender, max) + transfer so the paymaster
    // can pull its fee from the account in the same operation.
    let approve_calldata = token
        .approve(spender, U256::MAX)
        .calldata()
        .ok_or_else(|| anyhow!("failed to build approve calldata"))?;
    op.call_data = execute_batch_calldata(
        chain.provider.clone(),
        account,
        vec![
            (chain.dep.token, approve_calldata),
            (chain.dep.token, transfer_calldata),
        ],
    )?;

    // The batch changed the callData; estimate again before sponsorship.
    sign_userop(chain.provider.clone(), chain.entrypoint, &mut op, &wallet).await?;
    let est = bundler
        .estimate_user_operation_gas(op.to_rpc_json(), chain.entrypoint)
        .await
        .context("bundler gas estimate (with approval) failed")?;
    op.call_gas_limit = est.call_gas_limit;
    op.verification_gas_limit = est.verification_gas_limit;
    op.pre_verification_gas = est.pre_verification_gas;

    tracing::info!("requesting sponsorship data (pm_sponsorUserOperation)...");
    let sponsorship = paymaster
        .sponsor_user_operation(op.to_rpc_json(), chain.dep.token)
        .await
        .context("paymaster sponsorship request failed")?;
    op.paymaster_and_data = sponsorship.paymaster_and_data;

    // Gas limits returned with the sponsorship are the ones the paymaster
    // signed over; they replace the bundler estimates.
    if let Some(v) = sponsorship.call_gas_limit {
        op.call_gas_limit = v;
    }
    if let Some(v) = sponsorship.verification_gas_limit {
        op.verification_gas_limit = v;
    }
    if let Some(v) = sponsorship.pre_verification_gas {
        op.pre_verification_gas = v;
    }

    // Final signature over the sponsored operation.
    sign_userop(chain.provider.clone(), chain.entrypoint, &mut op, &wallet).await?;

    println!(
        "UserOperation (final):\n{}",
        serde_json::to_string_pretty(&op.to_rpc_json())?
    );

    if args.dry_run {
        println!("--dry-run set: not sending user operation.");
        return Ok(());
    }

    let user_op_hash = bundler
        .send_user_operation(op.to_rpc_json(), chain.entrypoint)
        .await
        .context("bundler send failed")?;
    println!("userOpHash: {}", encoding::fmt_h256(user_op_hash));

    if args.no_wait {
        println!("--no-wait set: not waiting for receipt.");
        return Ok(());
    }

    let receipt = bundler
        .wait_user_operation_receipt(user_op_hash, Duration::from_secs(args.max_wait_seconds))
        .await
        .context("failed waiting for userOp receipt")?;
    println!("UserOp receipt:\n{}", serde_json::to_string_pretty(&receipt)?);

    if !receipt
        .get("success")
        .and_then(|v| v.as_bool())
        .unwrap_or(true)
    {
        bail!("user operation reverted on-chain (see receipt above)");
    }

    println!(
        "transfer complete: {} {} -> {}",
        args.amount, symbol, recipient
    );

    Ok(())
}

fn secrets_dir() -> Result<PathBuf> {
    // Prefer the repo root `.secrets/` even when run from a subdirectory.
    let mut dir = std::env::current_dir().context("failed to read current dir")?;
    for _ in 0..6 {
        if dir.join(".git").exists() || dir.join("deployments").is_dir() {
            return Ok(dir.join(".secrets"));
        }
        if !dir.pop() {
            break;
        }
    }
    let cwd = std::env::current_dir().context("failed to read current dir")?;
    Ok(cwd.join(".secrets"))
}

fn write_owner_env_file(path: &PathBuf, owner: Address, private_key_hex: &str) -> Result<()> {
    let contents = format!(
        "# Generated by tokensend-aa --new-owner\n# DO NOT COMMIT THIS FILE.\nexport TOKENSEND_AA_OWNER_PRIVATE_KEY={}\nexport TOKENSEND_AA_OWNER_ADDRESS={}\n",
        private_key_hex, owner
    );

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("failed to create .secrets dir")?;
    }
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;

    // Best-effort restrictive permissions (unix).
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perm = fs::Permissions::from_mode(0o600);
        let _ = fs::set_permissions(path, perm);
    }

    Ok(())
}

fn generate_owner_wallet(chain_id: u64) -> Result<(LocalWallet, Address, String)> {
    let mut rng = OsRng;
    // Very low probability of an invalid key; loop until LocalWallet accepts.
    for _ in 0..64 {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        if bytes.iter().all(|b| *b == 0) {
            continue;
        }
        let pk_hex = format!("0x{}", hex::encode(bytes));
        if let Ok(mut wallet) = LocalWallet::from_str(&pk_hex) {
            wallet = wallet.with_chain_id(chain_id);
            let owner = wallet.address();
            return Ok((wallet, owner, pk_hex));
        }
    }
    Err(anyhow!(
        "failed to generate a valid random private key after multiple attempts"
    ))
}

fn load_or_generate_owner(common: &CommonArgs, chain_id: u64) -> Result<(LocalWallet, Address)> {
    if common.new_owner {
        let (wallet, owner, pk_hex) = generate_owner_wallet(chain_id)?;
        let path = secrets_dir()?.join(format!("owner_{}.env", hex::encode(owner.as_bytes())));
        write_owner_env_file(&path, owner, &pk_hex)?;
        tracing::info!(path = %path.display(), "generated new owner key");
        return Ok((wallet, owner));
    }

    let owner_pk = common.owner_private_key.clone().ok_or_else(|| {
        anyhow!(
            "missing TOKENSEND_AA_OWNER_PRIVATE_KEY (or --owner-private-key), or pass --new-owner"
        )
    })?;
    let wallet = LocalWallet::from_str(&owner_pk)
        .context("invalid owner private key")?
        .with_chain_id(chain_id);
    let owner = wallet.address();
    Ok((wallet, owner))
}

async fn compute_account_address<M: Middleware + 'static>(
    client: Arc<M>,
    factory: Address,
    owner: Address,
    salt: U256,
) -> Result<(Address, bool)> {
    let factory_abi = AbiParser::default()
        .parse(&["function getAddress(address owner, uint256 salt) view returns (address)"])?;
    let factory = Contract::new(factory, factory_abi, client.clone());

    let account: Address = factory
        .method("getAddress", (owner, salt))?
        .call()
        .await
        .context("factory.getAddress failed")?;

    let code = client
        .get_code(account, None)
        .await
        .context("eth_getCode failed")?;

    Ok((account, !code.as_ref().is_empty()))
}

async fn entrypoint_nonce<M: Middleware + 'static>(
    client: Arc<M>,
    entrypoint: Address,
    account: Address,
) -> Result<U256> {
    let entrypoint_abi = AbiParser::default()
        .parse(&["function getNonce(address sender, uint192 key) view returns (uint256)"])?;
    let entrypoint_c = Contract::new(entrypoint, entrypoint_abi, client);

    let nonce: U256 = entrypoint_c
        .method("getNonce", (account, U256::zero()))?
        .call()
        .await
        .context("entryPoint.getNonce failed")?;
    Ok(nonce)
}

async fn build_init_code<M: Middleware + 'static>(
    client: Arc<M>,
    factory: Address,
    owner: Address,
    salt: U256,
    deployed: bool,
) -> Result<Bytes> {
    if deployed {
        return Ok(Bytes::from(Vec::new()));
    }
    let factory_abi = AbiParser::default()
        .parse(&["function createAccount(address owner, uint256 salt) returns (address)"])?;
    let factory_c = Contract::new(factory, factory_abi, client);
    let create_calldata = factory_c
        .method::<_, Address>("createAccount", (owner, salt))?
        .calldata()
        .ok_or_else(|| anyhow!("failed to build createAccount calldata"))?;

    let mut v = Vec::with_capacity(20 + create_calldata.len());
    v.extend_from_slice(factory.as_bytes());
    v.extend_from_slice(create_calldata.as_ref());
    Ok(Bytes::from(v))
}

fn execute_calldata<M: Middleware + 'static>(
    client: Arc<M>,
    account: Address,
    target: Address,
    inner: Bytes,
) -> Result<Bytes> {
    // SimpleAccount.execute(address dest, uint256 value, bytes func)
    let abi = AbiParser::default()
        .parse(&["function execute(address dest, uint256 value, bytes func)"])?;
    let account_c = Contract::new(account, abi, client);
    account_c
        .method::<_, ()>("execute", (target, U256::zero(), inner))?
        .calldata()
        .ok_or_else(|| anyhow!("failed to build execute calldata"))
}

fn execute_batch_calldata<M: Middleware + 'static>(
    client: Arc<M>,
    account: Address,
    calls: Vec<(Address, Bytes)>,
) -> Result<Bytes> {
    // SimpleAccount.executeBatch(address[] dest, bytes[] func)
    let abi = AbiParser::default()
        .parse(&["function executeBatch(address[] dest, bytes[] func)"])?;
    let account_c = Contract::new(account, abi, client);
    let (dests, funcs): (Vec<Address>, Vec<Bytes>) = calls.into_iter().unzip();
    account_c
        .method::<_, ()>("executeBatch", (dests, funcs))?
        .calldata()
        .ok_or_else(|| anyhow!("failed to build executeBatch calldata"))
}

async fn sign_userop<M: Middleware + 'static>(
    client: Arc<M>,
    entrypoint: Address,
    op: &mut UserOperation,
    wallet: &LocalWallet,
) -> Result<()> {
    // Use the on-chain EntryPoint.getUserOpHash for correctness.
    let entrypoint_abi: Abi = serde_json::from_str(
        r#"[{"inputs":[{"components":[{"internalType":"address","name":"sender","type":"address"},{"internalType":"uint256","name":"nonce","type":"uint256"},{"internalType":"bytes","name":"initCode","type":"bytes"},{"internalType":"bytes","name":"callData","type":"bytes"},{"internalType":"uint256","name":"callGasLimit","type":"uint256"},{"internalType":"uint256","name":"verificationGasLimit","type":"uint256"},{"internalType":"uint256","name":"preVerificationGas","type":"uint256"},{"internalType":"uint256","name":"maxFeePerGas","type":"uint256"},{"internalType":"uint256","name":"maxPriorityFeePerGas","type":"uint256"},{"internalType":"bytes","name":"paymasterAndData","type":"bytes"},{"internalType":"bytes","name":"signature","type":"bytes"}],"internalType":"struct UserOperation","name":"userOp","type":"tuple"}],"name":"getUserOpHash","outputs":[{"internalType":"bytes32","name":"","type":"bytes32"}],"stateMutability":"view","type":"function"}]"#,
    )
    .context("failed to parse EntryPoint ABI")?;

    let entrypoint_c = Contract::new(entrypoint, entrypoint_abi, client);

    let user_op_tuple = op.as_abi_tuple();
    let user_op_hash: H256 = entrypoint_c
        .method("getUserOpHash", (user_op_tuple,))?
        .call()
        .await
        .context("entryPoint.getUserOpHash failed")?;

    let sig = wallet
        .sign_message(user_op_hash.as_bytes())
        .await
        .context("failed to sign userOpHash")?;

    op.signature = Bytes::from(sig.to_vec());

    Ok(())
}
