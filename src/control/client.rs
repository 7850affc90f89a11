//! Client for talking to a running `ci-notifier watch`

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use super::protocol::{ControlRequest, ControlResponse, MAX_FRAME_LEN};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Send one request and wait for its response
pub fn send_request(socket_path: &Path, request: &ControlRequest) -> Result<ControlResponse> {
    let stream = UnixStream::connect(socket_path).with_context(|| {
        format!(
            "Failed to connect to socket: {} (is `ci-notifier watch` running?)",
            socket_path.display()
        )
    })?;

    stream
        .set_write_timeout(Some(IO_TIMEOUT))
        .context("Failed to set write timeout")?;
    stream
        .set_read_timeout(Some(IO_TIMEOUT))
        .context("Failed to set read timeout")?;

    write_request(&stream, request)?;
    read_response(&stream)
}

fn write_request(mut stream: &UnixStream, request: &ControlRequest) -> Result<()> {
    let json = serde_json::to_vec(request).context("Failed to serialize request")?;

    let len = json.len() as u32;
    stream
        .write_all(&len.to_be_bytes())
        .context("Failed to write request length")?;
    stream
        .write_all(&json)
        .context("Failed to write request")?;
    stream.flush().context("Failed to flush stream")?;

    Ok(())
}

fn read_response(mut stream: &UnixStream) -> Result<ControlResponse> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .context("Failed to read response length")?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("Response too large: {} bytes", len);
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .context("Failed to read response body")?;

    serde_json::from_slice(&buf).context("Failed to parse response")
}
