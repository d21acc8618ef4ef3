//! Git packet-line framing.
//!
//! Each packet is prefixed with a 4-character hex length that includes the
//! prefix itself; `0000` is a flush packet.

use anyhow::{bail, ensure, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const FLUSH: &[u8] = b"0000";

/// Largest length a packet-line prefix can express.
const MAX_PKT_LEN: usize = 0xFFFF;

/// Encode `data` as one packet-line.
pub fn encode(data: &[u8]) -> Result<Vec<u8>> {
    let total_len = data.len() + 4;
    ensure!(
        total_len <= MAX_PKT_LEN,
        "packet-line data too large ({total_len} bytes)"
    );
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    Ok(buf)
}

/// An `ERR` packet carrying `message` to the client.
pub fn error_line(message: &str) -> Vec<u8> {
    encode(format!("ERR {message}\n").as_bytes())
        .unwrap_or_else(|_| b"0019ERR message too long\n".to_vec())
}

/// Read one data packet.  Flush and other special packets are rejected.
pub async fn read_data<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_hex = [0u8; 4];
    reader
        .read_exact(&mut len_hex)
        .await
        .context("failed to read packet-line length")?;
    let len_hex = std::str::from_utf8(&len_hex).context("non-UTF-8 packet-line length")?;
    let len = usize::from_str_radix(len_hex, 16)
        .with_context(|| format!("invalid packet-line length {len_hex:?}"))?;
    if len < 4 {
        bail!("expected a data packet, got special packet {len_hex}");
    }

    let mut data = vec![0u8; len - 4];
    reader
        .read_exact(&mut data)
        .await
        .context("truncated packet-line")?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_length_including_prefix() {
        assert_eq!(encode(b"a\n").unwrap(), b"0006a\n");
        assert!(encode(&vec![0u8; MAX_PKT_LEN]).is_err());
    }

    #[test]
    fn error_packet_format() {
        assert_eq!(error_line("nope"), b"000dERR nope\n");
    }

    #[tokio::test]
    async fn reads_one_data_packet() {
        let mut input: &[u8] = b"0009hello0000";
        assert_eq!(read_data(&mut input).await.unwrap(), b"hello");
        assert_eq!(input, FLUSH);
        assert!(read_data(&mut input).await.is_err());
    }

    #[tokio::test]
    async fn rejects_bad_length() {
        let mut input: &[u8] = b"zzzzhello";
        assert!(read_data(&mut input).await.is_err());
        let mut short: &[u8] = b"0010abc";
        assert!(read_data(&mut short).await.is_err());
    }
}
