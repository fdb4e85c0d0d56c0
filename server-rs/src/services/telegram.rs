//! Verification of Telegram Mini App `initData`.
//!
//! The data-check string is every field except `hash`, sorted by key and
//! joined as `key=value` lines. It is signed with HMAC-SHA256 under the key
//! `HMAC-SHA256("WebAppData", bot_token)`.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::models::TelegramProfile;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedInitData {
    pub profile: TelegramProfile,
    pub auth_date: i64,
    pub start_param: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InitDataError {
    #[error("initData is malformed: {0}")]
    Malformed(String),

    #[error("initData signature is invalid")]
    BadSignature,

    #[error("initData is too old")]
    Expired,
}

fn mac_for(bot_token: &str) -> Result<HmacSha256, InitDataError> {
    let key_error = |_| InitDataError::Malformed("HMAC key rejected".into());
    let mut secret = HmacSha256::new_from_slice(b"WebAppData").map_err(key_error)?;
    secret.update(bot_token.as_bytes());
    let secret = secret.finalize().into_bytes();
    HmacSha256::new_from_slice(&secret).map_err(key_error)
}

fn parse_pairs(init_data: &str) -> Result<BTreeMap<String, String>, InitDataError> {
    init_data
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = urlencoding::decode(k).map_err(|e| InitDataError::Malformed(e.to_string()))?;
            let v = urlencoding::decode(v).map_err(|e| InitDataError::Malformed(e.to_string()))?;
            Ok((k.into_owned(), v.into_owned()))
        })
        .collect()
}

fn data_check_string(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn verify_init_data(
    init_data: &str,
    bot_token: &str,
    max_age_secs: i64,
    now_unix: i64,
) -> Result<VerifiedInitData, InitDataError> {
    let mut fields = parse_pairs(init_data)?;
    let hash = fields
        .remove("hash")
        .ok_or_else(|| InitDataError::Malformed("hash missing".into()))?;
    let expected = hex::decode(&hash).map_err(|_| InitDataError::BadSignature)?;

    let mut mac = mac_for(bot_token)?;
    mac.update(data_check_string(&fields).as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| InitDataError::BadSignature)?;

    let auth_date: i64 = fields
        .get("auth_date")
        .and_then(|d| d.parse().ok())
        .ok_or_else(|| InitDataError::Malformed("auth_date missing".into()))?;
    if now_unix - auth_date > max_age_secs {
        return Err(InitDataError::Expired);
    }

    let user = fields
        .get("user")
        .ok_or_else(|| InitDataError::Malformed("user missing".into()))?;
    let profile: TelegramProfile =
        serde_json::from_str(user).map_err(|e| InitDataError::Malformed(e.to_string()))?;

    Ok(VerifiedInitData {
        profile,
        auth_date,
        start_param: fields.remove("start_param"),
    })
}
