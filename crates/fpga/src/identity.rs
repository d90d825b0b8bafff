//! Compact resource-class names derived from interface and AFU UUIDs.

use core::error::Error;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use error_stack::Report;
use error_stack::ResultExt;
use uuid::Uuid;

/// UUID reported by the driver when the FPGA firmware is not responsive.
pub const UNHEALTHY_UUID: &str = "ffffffffffffffffffffffffffffffff";

#[derive(Debug, derive_more::Display)]
pub enum IdentityError {
    #[display("failed to decode {interface_id:?} and {afu_id:?}")]
    Decode {
        interface_id: String,
        afu_id: String,
    },
}

impl Error for IdentityError {}

/// Lower-cases an ID and strips hyphens and surrounding whitespace.
pub fn canonize_id(id: &str) -> String {
    id.trim().replace('-', "").to_lowercase()
}

/// Whether `id` is a well-formed 128-bit UUID that is not the unhealthy
/// sentinel.
pub fn is_healthy_id(id: &str) -> bool {
    Uuid::try_parse(id.trim()).is_ok_and(|uuid| uuid.as_u128() != u128::MAX)
}

/// Encodes an interface/AFU UUID pair as `af-{iii}.{aaa}.{base64url}`.
///
/// The short prefixes keep the name traceable while the base64 part keeps
/// it injective and short enough for socket paths and resource names.
pub fn af_dev_type(interface_id: &str, afu_id: &str) -> Result<String, Report<IdentityError>> {
    let decode_err = || IdentityError::Decode {
        interface_id: interface_id.to_string(),
        afu_id: afu_id.to_string(),
    };

    let interface = Uuid::try_parse(interface_id.trim()).change_context_lazy(decode_err)?;
    let afu = Uuid::try_parse(afu_id.trim()).change_context_lazy(decode_err)?;

    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(interface.as_bytes());
    bytes[16..].copy_from_slice(afu.as_bytes());

    let interface_hex = interface.simple().to_string();
    let afu_hex = afu.simple().to_string();

    Ok(format!(
        "af-{}.{}.{}",
        &interface_hex[..3],
        &afu_hex[..3],
        URL_SAFE_NO_PAD.encode(bytes)
    ))
}
