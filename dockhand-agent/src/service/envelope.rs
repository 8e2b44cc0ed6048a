//! Deployment-specification envelope handling.
//!
//! The service delivers the spec either as plain JSON (`TEXT/JSON`) or as a
//! base64 PKCS7 SignedData blob (`PKCS7/JSON`). For the signed form the
//! embedded payload is extracted if the DER structure is well formed; the
//! certificate chain is not validated, matching the reference behavior.

use super::SpecEnvelope;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

pub const FORMAT_TEXT_JSON: &str = "TEXT/JSON";
pub const FORMAT_PKCS7_JSON: &str = "PKCS7/JSON";

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope has no payload")]
    MissingPayload,
    #[error("unsupported envelope format {0}")]
    UnsupportedFormat(String),
    #[error("invalid base64 payload: {0}")]
    Base64(String),
    #[error("malformed signature envelope")]
    MalformedPkcs7,
    #[error("embedded payload is not utf-8")]
    NotUtf8,
}

pub fn extract_payload(envelope: &SpecEnvelope) -> Result<String, EnvelopeError> {
    let payload = envelope
        .payload
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or(EnvelopeError::MissingPayload)?;

    match envelope.format.as_deref() {
        None | Some(FORMAT_TEXT_JSON) => Ok(payload.to_string()),
        Some(FORMAT_PKCS7_JSON) => {
            let der = BASE64
                .decode(payload.trim())
                .map_err(|e| EnvelopeError::Base64(e.to_string()))?;
            let content = pkcs7_content(&der).ok_or(EnvelopeError::MalformedPkcs7)?;
            String::from_utf8(content).map_err(|_| EnvelopeError::NotUtf8)
        }
        Some(other) => Err(EnvelopeError::UnsupportedFormat(other.to_string())),
    }
}

// OID 1.2.840.113549.1.7.1 (pkcs7 data), DER-encoded without tag/length.
const PKCS7_DATA_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01];

/// Depth-first walk of the DER tree: the signed content is the first octet
/// string encountered after the pkcs7-data content-type OID.
fn pkcs7_content(der: &[u8]) -> Option<Vec<u8>> {
    let mut seen_data_oid = false;
    walk(der, &mut seen_data_oid)
}

fn walk(mut input: &[u8], seen_data_oid: &mut bool) -> Option<Vec<u8>> {
    while !input.is_empty() {
        let (tag, contents, rest) = read_tlv(input)?;
        input = rest;

        let constructed = tag & 0x20 != 0;
        if constructed {
            if let Some(found) = walk(contents, seen_data_oid) {
                return Some(found);
            }
            continue;
        }
        match tag & 0x1f {
            // OBJECT IDENTIFIER
            0x06 => {
                if contents == PKCS7_DATA_OID {
                    *seen_data_oid = true;
                }
            }
            // OCTET STRING
            0x04 if *seen_data_oid => return Some(contents.to_vec()),
            _ => {}
        }
    }
    None
}

/// One DER TLV: (tag, contents, remainder). Handles long-form lengths.
fn read_tlv(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&len_byte, rest) = rest.split_first()?;

    let (len, rest) = if len_byte & 0x80 == 0 {
        (len_byte as usize, rest)
    } else {
        let n = (len_byte & 0x7f) as usize;
        if n == 0 || n > 4 || rest.len() < n {
            return None;
        }
        let mut len = 0usize;
        for &b in &rest[..n] {
            len = (len << 8) | b as usize;
        }
        (len, &rest[n..])
    };

    if rest.len() < len {
        return None;
    }
    Some((tag, &rest[..len], &rest[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlv(tag: u8, contents: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        let len = contents.len();
        if len < 0x80 {
            out.push(len as u8);
        } else {
            let bytes = len.to_be_bytes();
            let first = bytes.iter().position(|&b| b != 0).unwrap();
            out.push(0x80 | (bytes.len() - first) as u8);
            out.extend_from_slice(&bytes[first..]);
        }
        out.extend_from_slice(contents);
        out
    }

    /// Minimal SignedData: SEQ { OID signedData, [0] { SEQ { INTEGER 1,
    /// SET {}, SEQ { OID data, [0] { OCTET STRING payload } } } } }.
    fn signed_data(payload: &[u8]) -> Vec<u8> {
        let signed_data_oid = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];
        let content_info = tlv(
            0x30,
            &[
                tlv(0x06, PKCS7_DATA_OID),
                tlv(0xa0, &tlv(0x04, payload)),
            ]
            .concat(),
        );
        let inner = tlv(
            0x30,
            &[tlv(0x02, &[1]), tlv(0x31, &[]), content_info].concat(),
        );
        tlv(
            0x30,
            &[tlv(0x06, signed_data_oid), tlv(0xa0, &inner)].concat(),
        )
    }

    #[test]
    fn test_plain_text_payload_passes_through() {
        let envelope = SpecEnvelope {
            format: Some(FORMAT_TEXT_JSON.to_string()),
            payload: Some("{\"DeploymentId\":\"d-1\"}".to_string()),
        };
        assert_eq!(extract_payload(&envelope).unwrap(), "{\"DeploymentId\":\"d-1\"}");
    }

    #[test]
    fn test_pkcs7_payload_extracted_without_chain_validation() {
        let payload = br#"{"DeploymentId":"d-1"}"#;
        let envelope = SpecEnvelope {
            format: Some(FORMAT_PKCS7_JSON.to_string()),
            payload: Some(BASE64.encode(signed_data(payload))),
        };
        assert_eq!(
            extract_payload(&envelope).unwrap(),
            String::from_utf8_lossy(payload)
        );
    }

    #[test]
    fn test_large_pkcs7_payload_uses_long_form_lengths() {
        let payload = vec![b'a'; 1000];
        let envelope = SpecEnvelope {
            format: Some(FORMAT_PKCS7_JSON.to_string()),
            payload: Some(BASE64.encode(signed_data(&payload))),
        };
        assert_eq!(extract_payload(&envelope).unwrap().len(), 1000);
    }

    #[test]
    fn test_garbage_pkcs7_rejected() {
        let envelope = SpecEnvelope {
            format: Some(FORMAT_PKCS7_JSON.to_string()),
            payload: Some(BASE64.encode(b"not der at all")),
        };
        assert!(matches!(
            extract_payload(&envelope).unwrap_err(),
            EnvelopeError::MalformedPkcs7
        ));
    }

    #[test]
    fn test_unknown_format_rejected() {
        let envelope = SpecEnvelope {
            format: Some("XML".to_string()),
            payload: Some("<spec/>".to_string()),
        };
        assert!(matches!(
            extract_payload(&envelope).unwrap_err(),
            EnvelopeError::UnsupportedFormat(_)
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let envelope = SpecEnvelope {
            format: Some(FORMAT_TEXT_JSON.to_string()),
            payload: Some(String::new()),
        };
        assert!(matches!(
            extract_payload(&envelope).unwrap_err(),
            EnvelopeError::MissingPayload
        ));
    }
}
