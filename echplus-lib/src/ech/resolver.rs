use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tracing::debug;

use crate::error::{EchError, Result};

/// DNS record type HTTPS (SVCB-compatible service binding).
const TYPE_HTTPS: u16 = 65;
/// SvcParam key carrying the ECHConfigList.
const SVC_PARAM_ECH: u16 = 5;

pub(crate) const DOH_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetch the ECHConfigList advertised in `domain`'s HTTPS RR via the
/// given DoH endpoint (RFC 8484 GET form).
pub async fn query_ech_config(
    client: &reqwest::Client,
    doh_url: &str,
    domain: &str,
) -> Result<Vec<u8>> {
    let query = build_https_query(domain)?;
    let url = format!("{}?dns={}", normalize_doh_url(doh_url), URL_SAFE_NO_PAD.encode(&query));

    let resp = client
        .get(&url)
        .header("Accept", "application/dns-message")
        .timeout(DOH_TIMEOUT)
        .send()
        .await
        .map_err(|e| EchError::EchUnavailable(format!("DoH request failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(EchError::EchUnavailable(format!(
            "DoH server returned {}",
            resp.status()
        )));
    }
    let body = resp
        .bytes()
        .await
        .map_err(|e| EchError::EchUnavailable(format!("DoH body read failed: {e}")))?;

    let list = extract_ech_config(&body)?;
    debug!(domain, len = list.len(), "ECH config list resolved");
    Ok(list)
}

/// Accepts `host/path` and full URLs alike; DoH servers are https-only.
pub(crate) fn normalize_doh_url(url: &str) -> String {
    if url.starts_with("https://") || url.starts_with("http://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

/// Build a single-question DNS query for `domain`, type HTTPS, class IN.
/// The ID is zero so GET responses stay cacheable.
pub(crate) fn build_https_query(domain: &str) -> Result<Vec<u8>> {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(&[0x00, 0x00]); // ID
    msg.extend_from_slice(&[0x01, 0x00]); // RD
    msg.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    msg.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]); // AN/NS/AR

    for label in domain.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(EchError::Config(format!("invalid DNS label in {domain:?}")));
        }
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
    msg.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes()); // IN
    Ok(msg)
}

/// Walk a raw DNS response and return the value of the first `ech`
/// SvcParam found in an HTTPS answer record.
pub(crate) fn extract_ech_config(msg: &[u8]) -> Result<Vec<u8>> {
    if msg.len() < 12 {
        return Err(EchError::Protocol("DNS response shorter than header".to_string()));
    }
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]);
    let ancount = u16::from_be_bytes([msg[6], msg[7]]);

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(msg, pos)?;
        pos = checked_advance(msg, pos, 4)?; // QTYPE + QCLASS
    }

    for _ in 0..ancount {
        pos = skip_name(msg, pos)?;
        if pos + 10 > msg.len() {
            return Err(EchError::Protocol("truncated answer record".to_string()));
        }
        let rtype = u16::from_be_bytes([msg[pos], msg[pos + 1]]);
        let rdlength = u16::from_be_bytes([msg[pos + 8], msg[pos + 9]]) as usize;
        pos = checked_advance(msg, pos, 10)?;
        if pos + rdlength > msg.len() {
            return Err(EchError::Protocol("truncated rdata".to_string()));
        }
        if rtype == TYPE_HTTPS {
            if let Some(list) = parse_https_rdata(&msg[pos..pos + rdlength])? {
                return Ok(list);
            }
        }
        pos += rdlength;
    }

    Err(EchError::EchUnavailable(
        "no HTTPS record carries an ech parameter".to_string(),
    ))
}

/// HTTPS rdata: priority, target name, then `(key, len, value)` SvcParams.
fn parse_https_rdata(rdata: &[u8]) -> Result<Option<Vec<u8>>> {
    if rdata.len() < 2 {
        return Err(EchError::Protocol("HTTPS rdata shorter than priority".to_string()));
    }
    let mut pos = 2;

    // Target name: uncompressed label sequence, single zero for root.
    loop {
        let len = *rdata
            .get(pos)
            .ok_or_else(|| EchError::Protocol("truncated HTTPS target name".to_string()))?
            as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        pos = checked_advance(rdata, pos, len)?;
    }

    while pos + 4 <= rdata.len() {
        let key = u16::from_be_bytes([rdata[pos], rdata[pos + 1]]);
        let len = u16::from_be_bytes([rdata[pos + 2], rdata[pos + 3]]) as usize;
        pos += 4;
        if pos + len > rdata.len() {
            return Err(EchError::Protocol("truncated SvcParam value".to_string()));
        }
        if key == SVC_PARAM_ECH {
            return Ok(Some(rdata[pos..pos + len].to_vec()));
        }
        pos += len;
    }
    Ok(None)
}

/// Skip a possibly compressed name starting at `pos`; returns the offset
/// of the byte following it. A pointer (`0xC0xx`) terminates the name.
fn skip_name(msg: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        let len = *msg
            .get(pos)
            .ok_or_else(|| EchError::Protocol("truncated DNS name".to_string()))?;
        if len & 0xC0 == 0xC0 {
            return checked_advance(msg, pos, 2);
        }
        pos += 1;
        if len == 0 {
            return Ok(pos);
        }
        pos = checked_advance(msg, pos, len as usize)?;
    }
}

fn checked_advance(msg: &[u8], pos: usize, by: usize) -> Result<usize> {
    let next = pos
        .checked_add(by)
        .filter(|n| *n <= msg.len())
        .ok_or_else(|| EchError::Protocol("DNS message overrun".to_string()))?;
    Ok(next)
}
