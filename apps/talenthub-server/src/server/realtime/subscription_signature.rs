use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::server::auth::{hex_encode, random_bytes};

type HmacSha256 = Hmac<Sha256>;

/// Connection identifier in the `{digits}.{digits}` shape clients echo back
/// when requesting subscription auth.
pub(crate) fn new_socket_id() -> String {
    let bytes = random_bytes::<8>();
    let high = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let low = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    format!("{high}.{low}")
}

pub(crate) fn is_valid_socket_id(value: &str) -> bool {
    let Some((high, low)) = value.split_once('.') else {
        return false;
    };
    [high, low]
        .iter()
        .all(|part| !part.is_empty() && part.len() <= 20 && part.bytes().all(|b| b.is_ascii_digit()))
}

fn subscription_mac(secret: &[u8], socket_id: &str, channel: &str) -> anyhow::Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|error| anyhow::anyhow!("invalid realtime secret: {error}"))?;
    mac.update(socket_id.as_bytes());
    mac.update(b":");
    mac.update(channel.as_bytes());
    Ok(mac)
}

/// `"{app_key}:{hex(hmac_sha256(secret, "{socket_id}:{channel}"))}"`
pub(crate) fn sign_subscription(
    app_key: &str,
    secret: &[u8],
    socket_id: &str,
    channel: &str,
) -> anyhow::Result<String> {
    let signature = subscription_mac(secret, socket_id, channel)?
        .finalize()
        .into_bytes();
    Ok(format!("{app_key}:{}", hex_encode(&signature)))
}

pub(crate) fn verify_subscription(
    app_key: &str,
    secret: &[u8],
    socket_id: &str,
    channel: &str,
    auth: &str,
) -> bool {
    let Some((presented_key, presented_signature)) = auth.split_once(':') else {
        return false;
    };
    if presented_key != app_key {
        return false;
    }
    let Some(signature) = hex_decode(presented_signature) else {
        return false;
    };
    subscription_mac(secret, socket_id, channel)
        .is_ok_and(|mac| mac.verify_slice(&signature).is_ok())
}

fn hex_decode(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(value.get(index..index + 2)?, 16).ok())
        .collect()
}
