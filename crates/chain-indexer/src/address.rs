//! SS58 account addresses.
//!
//! Layout: `network prefix (1 or 2 bytes) || public key || checksum (2 bytes)`,
//! base58 encoded. The checksum is the head of `blake2b-512("SS58PRE" || prefix || key)`.

use blake2::{
    Blake2b512,
    Digest,
};

const CHECKSUM_PREFIX: &[u8] = b"SS58PRE";
const CHECKSUM_LEN: usize = 2;
/// Largest network id representable by the two byte prefix.
pub const MAX_NETWORK_ID: u16 = 0b0011_1111_1111_1111;

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address checksum mismatch")]
    ChecksumMismatch,
    #[error("malformed address")]
    MalformedAddress,
    #[error("address is not valid base58")]
    Base58(#[source] bs58::decode::Error),
}

/// Encodes `public_key` for `network_id`. Ids above [`MAX_NETWORK_ID`] are
/// truncated to their low 14 bits.
pub fn encode(public_key: &[u8], network_id: u16) -> String {
    let mut data = network_prefix(network_id);
    data.extend_from_slice(public_key);
    let checksum = ss58_hash(&data);
    data.extend_from_slice(&checksum[..CHECKSUM_LEN]);
    bs58::encode(data).into_string()
}

/// Decodes an address into `(network_id, public_key)`.
pub fn decode(address: &str) -> Result<(u16, Vec<u8>), AddressError> {
    let data = bs58::decode(address)
        .into_vec()
        .map_err(AddressError::Base58)?;

    let (prefix_len, network_id) = match data.as_slice() {
        [first @ 0..=63, ..] => (1, u16::from(*first)),
        [first @ 64..=127, second, ..] => {
            let lower = (*first << 2) | (*second >> 6);
            let upper = *second & 0b0011_1111;
            (2, u16::from(lower) | (u16::from(upper) << 8))
        }
        _ => return Err(AddressError::MalformedAddress),
    };

    if data.len() < prefix_len + CHECKSUM_LEN {
        return Err(AddressError::MalformedAddress);
    }

    let (body, checksum) = data.split_at(data.len() - CHECKSUM_LEN);
    if checksum != &ss58_hash(body)[..CHECKSUM_LEN] {
        return Err(AddressError::ChecksumMismatch);
    }

    Ok((network_id, body[prefix_len..].to_vec()))
}

fn network_prefix(network_id: u16) -> Vec<u8> {
    let id = network_id & MAX_NETWORK_ID;
    if id < 64 {
        return vec![id as u8];
    }
    let first = ((id & 0b0000_0000_1111_1100) >> 2) as u8;
    let second = ((id >> 8) as u8) | (((id & 0b0000_0000_0000_0011) as u8) << 6);
    vec![first | 0b0100_0000, second]
}

fn ss58_hash(data: &[u8]) -> Vec<u8> {
    let mut hasher = Blake2b512::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBLIC_KEY: &str = "0a94123ede29475590001f364d58ce88a83647d63bfd7b38e65e0ae58a78f804";

    fn key() -> Vec<u8> {
        hex::decode(PUBLIC_KEY).unwrap()
    }

    #[test]
    fn encodes_crust_address() {
        assert_eq!(
            encode(&key(), 66),
            "cTGaWK3pHpExP1cyrZNArNfWAWidtPCZx29mTNbDY3Yy9R9HG"
        );
    }

    #[test]
    fn encodes_single_byte_prefix() {
        assert_eq!(
            encode(&key(), 42),
            "5CJaKegXkjvNvR1THqrNXt2vmbgTe4uUe4TCVgmPbz8wULfJ"
        );
    }

    #[test]
    fn decodes_crust_address() {
        let (network, public_key) =
            decode("cTGaWK3pHpExP1cyrZNArNfWAWidtPCZx29mTNbDY3Yy9R9HG").unwrap();
        assert_eq!(network, 66);
        assert_eq!(public_key, key());
    }

    #[test]
    fn round_trips_across_prefix_widths() {
        for network in [0, 1, 42, 63, 64, 66, 255, 256, 2254, 8191, MAX_NETWORK_ID] {
            for public_key in [vec![7u8], key(), vec![0xffu8; 33]] {
                let address = encode(&public_key, network);
                let (decoded_network, decoded_key) = decode(&address).unwrap();
                assert_eq!(decoded_network, network, "network {network}");
                assert_eq!(decoded_key, public_key);
            }
        }
    }

    #[test]
    fn checksum_mutation_is_rejected() {
        let address = encode(&key(), 66);
        let raw = bs58::decode(&address).into_vec().unwrap();
        let len = raw.len();
        for position in [len - 2, len - 1] {
            let mut mutated = raw.clone();
            mutated[position] ^= 0x01;
            let result = decode(&bs58::encode(mutated).into_string());
            assert!(matches!(result, Err(AddressError::ChecksumMismatch)));
        }
    }

    #[test]
    fn short_input_is_malformed() {
        let one_byte = bs58::encode([5u8]).into_string();
        assert!(matches!(decode(&one_byte), Err(AddressError::MalformedAddress)));
        assert!(matches!(decode(""), Err(AddressError::MalformedAddress)));
    }

    #[test]
    fn reserved_prefix_is_malformed() {
        let raw = [0b1000_0000u8, 0, 1, 2, 3];
        let address = bs58::encode(raw).into_string();
        assert!(matches!(decode(&address), Err(AddressError::MalformedAddress)));
    }

    #[test]
    fn invalid_base58_is_reported() {
        assert!(matches!(decode("0OIl"), Err(AddressError::Base58(_))));
    }
}
