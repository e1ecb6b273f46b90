//! Bit-exact wire codec for identity records.
//!
//! Two opcodes share the session: [`OP_PING`] carries an empty request and a
//! marshalled [`NodeId`] response; [`OP_LOOKUP`] carries a marshalled target
//! and a marshalled ID list response.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! id   := public_key(32) || nonce(32) || addr_len(u32) || addr(utf-8)
//! list := count(u32) || id*
//! ```
//!
//! Decoding is strict: truncated input, trailing bytes, oversized fields,
//! and invalid UTF-8 all fail. Inputs arrive from untrusted peers, so every
//! length is bounds-checked before allocation.

use crate::error::ProtocolError;
use crate::identity::{NodeId, ID_SIZE};

/// Liveness probe. Empty request; response is the responder's marshalled ID.
pub const OP_PING: u8 = 0x03;

/// Find-node RPC. Request is a marshalled target ID; response is an ID list.
pub const OP_LOOKUP: u8 = 0x04;

/// Longest accepted address string.
pub const MAX_ADDR_LEN: usize = 256;

/// Most IDs accepted in one list; well above any sane bucket size.
pub const MAX_LIST_LEN: usize = 1024;

/// Encode a single ID.
pub fn marshal_id(id: &NodeId) -> Vec<u8> {
    let addr = id.address().as_bytes();
    let mut buf = Vec::with_capacity(ID_SIZE * 2 + 4 + addr.len());
    buf.extend_from_slice(id.public_key());
    buf.extend_from_slice(id.nonce());
    buf.extend_from_slice(&(addr.len() as u32).to_le_bytes());
    buf.extend_from_slice(addr);
    buf
}

/// Encode a list of IDs, count-prefixed.
pub fn marshal_ids(ids: &[NodeId]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    for id in ids {
        buf.extend_from_slice(&marshal_id(id));
    }
    buf
}

/// Decode a single ID, rejecting trailing bytes.
pub fn unmarshal_id(buf: &[u8]) -> Result<NodeId, ProtocolError> {
    let mut cursor = buf;
    let id = read_id(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(ProtocolError::Decode(format!(
            "{} trailing bytes after id",
            cursor.len()
        )));
    }
    Ok(id)
}

/// Decode a count-prefixed ID list, rejecting trailing bytes.
pub fn unmarshal_ids(buf: &[u8]) -> Result<Vec<NodeId>, ProtocolError> {
    let mut cursor = buf;
    let count = read_u32(&mut cursor)? as usize;
    if count > MAX_LIST_LEN {
        return Err(ProtocolError::Decode(format!(
            "id list count {count} exceeds limit {MAX_LIST_LEN}"
        )));
    }
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(read_id(&mut cursor)?);
    }
    if !cursor.is_empty() {
        return Err(ProtocolError::Decode(format!(
            "{} trailing bytes after id list",
            cursor.len()
        )));
    }
    Ok(ids)
}

fn read_id(cursor: &mut &[u8]) -> Result<NodeId, ProtocolError> {
    let public_key: [u8; ID_SIZE] = read_array(cursor, "public key")?;
    let nonce: [u8; ID_SIZE] = read_array(cursor, "nonce")?;
    let addr_len = read_u32(cursor)? as usize;
    if addr_len > MAX_ADDR_LEN {
        return Err(ProtocolError::Decode(format!(
            "address length {addr_len} exceeds limit {MAX_ADDR_LEN}"
        )));
    }
    let addr_bytes = take(cursor, addr_len, "address")?;
    let address = std::str::from_utf8(addr_bytes)
        .map_err(|_| ProtocolError::Decode("address is not valid utf-8".into()))?
        .to_owned();
    Ok(NodeId::new(public_key, nonce, address))
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32, ProtocolError> {
    let bytes = take(cursor, 4, "length prefix")?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_array<const N: usize>(
    cursor: &mut &[u8],
    what: &'static str,
) -> Result<[u8; N], ProtocolError> {
    let bytes = take(cursor, N, what)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn take<'a>(
    cursor: &mut &'a [u8],
    n: usize,
    what: &'static str,
) -> Result<&'a [u8], ProtocolError> {
    if cursor.len() < n {
        return Err(ProtocolError::Decode(format!(
            "truncated {what}: need {n} bytes, have {}",
            cursor.len()
        )));
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn sample_id(addr: &str) -> NodeId {
        Keypair::generate(0, 0).expect("puzzle search failed").id(addr)
    }

    #[test]
    fn id_roundtrip_preserves_every_field() {
        let id = sample_id("198.51.100.7:30303");
        let decoded = unmarshal_id(&marshal_id(&id)).expect("decode failed");

        assert_eq!(decoded.public_key(), id.public_key());
        assert_eq!(decoded.nonce(), id.nonce());
        assert_eq!(decoded.checksum(), id.checksum());
        assert_eq!(decoded.address(), id.address());
    }

    #[test]
    fn list_roundtrip() {
        let ids: Vec<NodeId> = (0..5).map(|i| sample_id(&format!("10.0.0.{i}:1"))).collect();
        let decoded = unmarshal_ids(&marshal_ids(&ids)).expect("decode failed");
        assert_eq!(decoded, ids);

        let empty = unmarshal_ids(&marshal_ids(&[])).expect("decode failed");
        assert!(empty.is_empty());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let encoded = marshal_id(&sample_id("10.0.0.1:1"));
        for cut in [0, 1, 31, 63, 65, encoded.len() - 1] {
            assert!(
                unmarshal_id(&encoded[..cut]).is_err(),
                "truncation at {cut} must fail"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = marshal_id(&sample_id("10.0.0.1:1"));
        encoded.push(0);
        assert!(matches!(
            unmarshal_id(&encoded),
            Err(ProtocolError::Decode(_))
        ));

        let mut list = marshal_ids(&[sample_id("10.0.0.1:1")]);
        list.push(0);
        assert!(unmarshal_ids(&list).is_err());
    }

    #[test]
    fn oversized_address_is_rejected() {
        let id = sample_id(&"x".repeat(MAX_ADDR_LEN + 1));
        assert!(unmarshal_id(&marshal_id(&id)).is_err());
    }

    #[test]
    fn absurd_list_count_is_rejected_before_allocation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(unmarshal_ids(&buf).is_err());
    }

    #[test]
    fn invalid_utf8_address_is_rejected() {
        let id = sample_id("ok");
        let mut encoded = marshal_id(&id);
        let addr_start = encoded.len() - 2;
        encoded[addr_start] = 0xff;
        encoded[addr_start + 1] = 0xfe;
        assert!(unmarshal_id(&encoded).is_err());
    }
}
