//! TLS ClientHello SNI extraction.
//!
//! The HTTPS ingress must pick a service before deciding whether to
//! terminate or pass TLS through, so it peeks the ClientHello and pulls the
//! server name out by hand.

use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum SniError {
    #[error("client hello truncated or malformed")]
    Malformed,

    #[error("invalid sni hostname: {0}")]
    InvalidHostname(String),

    #[error("no sni extension present")]
    NotPresent,
}

/// Extract the SNI hostname from a complete TLS ClientHello record.
pub fn extract_sni(client_hello: &[u8]) -> Result<String, SniError> {
    // Record header (5) + handshake header (4) + version (2) + random (32)
    if client_hello.len() < 43 {
        return Err(SniError::Malformed);
    }

    let mut offset = 9;

    // ClientHello version
    offset += 2;
    // Random
    offset += 32;

    // Session id
    if offset >= client_hello.len() {
        return Err(SniError::Malformed);
    }
    let session_id_len = client_hello[offset] as usize;
    offset += 1 + session_id_len;

    // Cipher suites
    if offset + 2 > client_hello.len() {
        return Err(SniError::Malformed);
    }
    let cipher_suites_len =
        u16::from_be_bytes([client_hello[offset], client_hello[offset + 1]]) as usize;
    offset += 2 + cipher_suites_len;

    // Compression methods
    if offset >= client_hello.len() {
        return Err(SniError::Malformed);
    }
    let compression_len = client_hello[offset] as usize;
    offset += 1 + compression_len;

    // Extensions
    if offset + 2 > client_hello.len() {
        return Err(SniError::Malformed);
    }
    let extensions_len =
        u16::from_be_bytes([client_hello[offset], client_hello[offset + 1]]) as usize;
    offset += 2;

    let extensions_end = offset + extensions_len;
    if extensions_end > client_hello.len() {
        return Err(SniError::Malformed);
    }

    // server_name extension is type 0x0000
    while offset + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([client_hello[offset], client_hello[offset + 1]]);
        let ext_len =
            u16::from_be_bytes([client_hello[offset + 2], client_hello[offset + 3]]) as usize;
        offset += 4;

        if offset + ext_len > extensions_end {
            return Err(SniError::Malformed);
        }

        if ext_type == 0x0000 {
            return parse_sni_extension(&client_hello[offset..offset + ext_len]);
        }

        offset += ext_len;
    }

    Err(SniError::NotPresent)
}

fn parse_sni_extension(data: &[u8]) -> Result<String, SniError> {
    if data.len() < 5 {
        return Err(SniError::Malformed);
    }

    // server_name_list length
    let mut offset = 2;

    // name_type must be 0 (host_name)
    if data[offset] != 0 {
        return Err(SniError::InvalidHostname("unknown name type".to_string()));
    }
    offset += 1;

    let name_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
    offset += 2;

    if offset + name_len > data.len() {
        return Err(SniError::Malformed);
    }

    let hostname = String::from_utf8(data[offset..offset + name_len].to_vec())
        .map_err(|_| SniError::InvalidHostname("not utf-8".to_string()))?;

    if hostname.is_empty() {
        return Err(SniError::InvalidHostname("empty hostname".to_string()));
    }

    trace!("extracted sni hostname: {hostname}");
    Ok(hostname)
}

/// Build a ClientHello for tests.
#[cfg(test)]
pub(crate) fn synthetic_client_hello(hostname: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();
    if let Some(host) = hostname {
        let name = host.as_bytes();
        let mut sni = Vec::new();
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list len
        sni.push(0); // host_name
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        extensions.extend_from_slice(&0u16.to_be_bytes()); // type server_name
        extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni);
    }

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session id len
    body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites len
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1); // compression methods len
    body.push(0); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(0x01); // ClientHello
    let len = (body.len() as u32).to_be_bytes();
    handshake.extend_from_slice(&len[1..]); // 3-byte length
    handshake.extend_from_slice(&body);

    let mut record = Vec::new();
    record.push(0x16); // handshake record
    record.extend_from_slice(&[0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
