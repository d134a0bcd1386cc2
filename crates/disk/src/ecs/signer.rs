//! Request signing for the ECS RPC API (signature version 1.0, HMAC-SHA1).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::{collections::BTreeMap, fmt::Write};

/// RFC 3986 percent-encoding: everything but unreserved characters is escaped.
pub(crate) fn percent_encode(value: &str) -> String {
  let mut out = String::with_capacity(value.len());
  for byte in value.bytes() {
    match byte {
      b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
      _ => {
        let _ = write!(out, "%{:02X}", byte);
      }
    }
  }
  out
}

/// Sorted, encoded `key=value` pairs joined by `&`.
pub(crate) fn canonical_query(params: &BTreeMap<String, String>) -> String {
  params
    .iter()
    .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
    .collect::<Vec<_>>()
    .join("&")
}

pub(crate) fn string_to_sign(method: &str, params: &BTreeMap<String, String>) -> String {
  format!(
    "{}&{}&{}",
    method,
    percent_encode("/"),
    percent_encode(&canonical_query(params))
  )
}

/// Base64 HMAC-SHA1 of the string to sign, keyed with `secret&`.
pub(crate) fn sign(secret: &str, string_to_sign: &str) -> String {
  let key = format!("{}&", secret);
  // HMAC accepts keys of any length.
  let mut mac = match Hmac::<Sha1>::new_from_slice(key.as_bytes()) {
    Ok(mac) => mac,
    Err(_) => return String::new(),
  };
  mac.update(string_to_sign.as_bytes());
  STANDARD.encode(mac.finalize().into_bytes())
}
