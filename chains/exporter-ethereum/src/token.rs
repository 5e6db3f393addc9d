//! Token-standard probing and the minimal ABI plumbing behind it.
//!
//! Classification is deliberately revert-tolerant: a contract is what its
//! selectors say it is. Permanent call failures mean "selector unsupported";
//! transient failures propagate so an outage never poisons the cached kind.

use ethers_core::abi::{self, ParamType, Token};
use ethers_core::types::{Bytes, H160, H256, U256};

use exporter_core::{BlockTag, EvmRpc, RpcError, TokenKind};

pub const SELECTOR_DECIMALS: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];
pub const SELECTOR_TOTAL_SUPPLY: [u8; 4] = [0x18, 0x16, 0x0d, 0xdd];
pub const SELECTOR_BALANCE_OF: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
pub const SELECTOR_OWNER_OF: [u8; 4] = [0x63, 0x52, 0x21, 0x1e];
pub const SELECTOR_SUPPORTS_INTERFACE: [u8; 4] = [0x01, 0xff, 0xc9, 0xa7];

/// ERC-165 interface id of ERC-721.
const ERC721_INTERFACE_ID: [u8; 4] = [0x80, 0xac, 0x58, 0xcd];

/// keccak256("Transfer(address,address,uint256)"); shared by ERC-20 and
/// ERC-721.
const TRANSFER_TOPIC: [u8; 32] = [
    0xdd, 0xf2, 0x52, 0xad, 0x1b, 0xe2, 0xc8, 0x9b, 0x69, 0xc2, 0xb0, 0x68, 0xfc, 0x37, 0x8d,
    0xaa, 0x95, 0x2b, 0xa7, 0xf1, 0x63, 0xc4, 0xa1, 0x16, 0x28, 0xf5, 0x5a, 0x4d, 0xf5, 0x23,
    0xb3, 0xef,
];

pub fn transfer_topic() -> H256 {
    H256(TRANSFER_TOPIC)
}

pub fn encode_call(selector: [u8; 4], args: &[Token]) -> Bytes {
    let mut data = selector.to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

pub fn decode_uint(output: &Bytes) -> Result<U256, RpcError> {
    let tokens = abi::decode(&[ParamType::Uint(256)], output.as_ref())
        .map_err(|e| RpcError::Value(format!("expected uint256 return: {e}")))?;
    match tokens.first() {
        Some(Token::Uint(value)) => Ok(*value),
        _ => Err(RpcError::Value("expected uint256 return".into())),
    }
}

pub fn decode_bool(output: &Bytes) -> Result<bool, RpcError> {
    let tokens = abi::decode(&[ParamType::Bool], output.as_ref())
        .map_err(|e| RpcError::Value(format!("expected bool return: {e}")))?;
    match tokens.first() {
        Some(Token::Bool(value)) => Ok(*value),
        _ => Err(RpcError::Value("expected bool return".into())),
    }
}

pub fn decode_address(output: &Bytes) -> Result<H160, RpcError> {
    let tokens = abi::decode(&[ParamType::Address], output.as_ref())
        .map_err(|e| RpcError::Value(format!("expected address return: {e}")))?;
    match tokens.first() {
        Some(Token::Address(value)) => Ok(*value),
        _ => Err(RpcError::Value("expected address return".into())),
    }
}

/// Classify a contract by probing standard selectors. Cached by the caller
/// per (chain, address) for the process lifetime, so transient errors must
/// bubble instead of degrading to `Unknown`.
pub async fn classify_contract<R>(rpc: &R, address: H160) -> Result<TokenKind, RpcError>
where
    R: EvmRpc + ?Sized,
{
    let code = rpc.code(address, BlockTag::Latest).await?;
    if code.as_ref().is_empty() {
        return Ok(TokenKind::Unknown);
    }

    if let Some(decimals) = probe_uint(rpc, address, SELECTOR_DECIMALS, &[]).await? {
        return Ok(TokenKind::Erc20 {
            decimals: decimals.min(U256::from(u8::MAX)).as_u64() as u8,
        });
    }

    if supports_erc721_interface(rpc, address).await? {
        return Ok(TokenKind::Erc721);
    }

    // Pre-ERC-165 collections: an ownerOf that answers for any id is enough.
    let owner_probe = probe(rpc, address, SELECTOR_OWNER_OF, &[Token::Uint(U256::one())]).await?;
    if owner_probe.map(|out| decode_address(&out).is_ok()) == Some(true) {
        return Ok(TokenKind::Erc721);
    }

    // A supply-bearing token without decimals: treated as ERC-20 with the
    // ecosystem-default 18.
    if probe_uint(rpc, address, SELECTOR_TOTAL_SUPPLY, &[]).await?.is_some() {
        return Ok(TokenKind::Erc20 { decimals: 18 });
    }

    Ok(TokenKind::Unknown)
}

pub async fn total_supply<R>(rpc: &R, contract: H160) -> Result<Option<U256>, RpcError>
where
    R: EvmRpc + ?Sized,
{
    probe_uint(rpc, contract, SELECTOR_TOTAL_SUPPLY, &[]).await
}

pub async fn balance_of<R>(rpc: &R, contract: H160, account: H160) -> Result<U256, RpcError>
where
    R: EvmRpc + ?Sized,
{
    let data = encode_call(SELECTOR_BALANCE_OF, &[Token::Address(account)]);
    let out = rpc.call(contract, data, BlockTag::Latest).await?;
    decode_uint(&out)
}

/// `ownerOf(token_id)`. `Ok(None)` when the contract rejects the id (burned
/// or never minted).
pub async fn owner_of<R>(rpc: &R, contract: H160, token_id: U256) -> Result<Option<H160>, RpcError>
where
    R: EvmRpc + ?Sized,
{
    match probe(rpc, contract, SELECTOR_OWNER_OF, &[Token::Uint(token_id)]).await? {
        Some(out) => Ok(decode_address(&out).ok()),
        None => Ok(None),
    }
}

async fn supports_erc721_interface<R>(rpc: &R, address: H160) -> Result<bool, RpcError>
where
    R: EvmRpc + ?Sized,
{
    let arg = Token::FixedBytes(ERC721_INTERFACE_ID.to_vec());
    match probe(rpc, address, SELECTOR_SUPPORTS_INTERFACE, &[arg]).await? {
        Some(out) => Ok(decode_bool(&out).unwrap_or(false)),
        None => Ok(false),
    }
}

/// Issue a call probe. `Ok(None)` on permanent rejection, `Err` on transient
/// failure.
async fn probe<R>(
    rpc: &R,
    address: H160,
    selector: [u8; 4],
    args: &[Token],
) -> Result<Option<Bytes>, RpcError>
where
    R: EvmRpc + ?Sized,
{
    match rpc.call(address, encode_call(selector, args), BlockTag::Latest).await {
        Ok(out) => Ok(Some(out)),
        Err(err) if err.is_transient() => Err(err),
        Err(_) => Ok(None),
    }
}

async fn probe_uint<R>(
    rpc: &R,
    address: H160,
    selector: [u8; 4],
    args: &[Token],
) -> Result<Option<U256>, RpcError>
where
    R: EvmRpc + ?Sized,
{
    match probe(rpc, address, selector, args).await? {
        Some(out) => Ok(decode_uint(&out).ok()),
        None => Ok(None),
    }
}
