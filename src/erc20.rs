use ethers::contract::abigen;

// Minimal ERC20 surface: reads for display and amount scaling, plus the two
// calls that end up inside the UserOperation batch. `transfer` and `approve`
// are never sent directly from an EOA here; only their calldata is used.
abigen!(
    Erc20,
    r#"[
        function decimals() view returns (uint8)
        function symbol() view returns (string)
        function balanceOf(address owner) view returns (uint256)
        function transfer(address to, uint256 amount) returns (bool)
        function approve(address spender, uint256 amount) returns (bool)
    ]"#
);
