//! Bridge contract ABI definition
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the bridge contract.

use alloy::sol;

sol! {
    /// Bridge contract deployed on both chains
    #[sol(rpc)]
    contract BridgeContract {
        /// Mint wrapped tokens for a lock observed on the source chain
        ///
        /// # Arguments
        /// * `srcChainId` - Numeric chain id of the source chain
        /// * `nonce` - Lock nonce assigned by the source contract
        /// * `sender` - Depositor on the source chain as a universal address
        /// * `recipient` - Recipient on this chain
        /// * `amount` - Amount to mint
        /// * `srcTxHash` - Source transaction that emitted the lock
        /// * `signatures` - Validator signatures over the relay digest, ordered by signer address
        ///
        /// The contract rebuilds the relay digest from these arguments and
        /// recovers each signature against it.
        function mint(
            uint64 srcChainId,
            uint64 nonce,
            bytes32 sender,
            address recipient,
            uint256 amount,
            bytes32 srcTxHash,
            bytes[] signatures
        ) external;

        /// Release escrowed tokens for a burn observed on the source chain
        function release(
            uint64 srcChainId,
            uint64 nonce,
            bytes32 sender,
            address recipient,
            uint256 amount,
            bytes32 srcTxHash,
            bytes[] signatures
        ) external;

        /// Whether the proof for a source event has already been used
        function isRelayed(
            uint64 srcChainId,
            uint8 eventType,
            uint64 nonce
        ) external view returns (bool relayed);

        /// Tokens escrowed for minting on the other chain
        event Locked(
            uint64 indexed nonce,
            address indexed sender,
            bytes32 recipient,
            uint256 amount
        );

        /// Wrapped tokens burned for release on the other chain
        event Burned(
            uint64 indexed nonce,
            address indexed sender,
            bytes32 recipient,
            uint256 amount
        );

        /// A mint or release was executed for a source event
        event Relayed(
            uint64 indexed srcChainId,
            uint64 indexed nonce,
            uint8 indexed eventType,
            address recipient,
            uint256 amount
        );
    }
}
