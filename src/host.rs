//! Browser native-messaging host: length-prefixed JSON frames on
//! stdin/stdout. Nothing else may be written to stdout while serving.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::io::{self, Read, Write};

use crate::cache::LocalCache;
use crate::notify::Notifier;
use crate::protocol::{Message, Response};
use crate::remote::DocumentStore;
use crate::sync::SyncEngine;

/// Browsers refuse host messages above 1 MiB.
pub const MAX_FRAME: usize = 1024 * 1024;

#[derive(Debug, PartialEq)]
pub enum Frame {
    Body(Vec<u8>),
    /// Payload was skipped; carries its declared length.
    Oversized(usize),
}

/// `None` on a clean end of input before a new frame. Input that stops
/// inside a header is an error.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => anyhow::bail!("Input ended inside a frame header"),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("Failed to read frame header"),
        }
    }
    let len = u32::from_ne_bytes(header) as usize;
    if len > MAX_FRAME {
        let skipped = io::copy(&mut reader.by_ref().take(len as u64), &mut io::sink())
            .context("Failed to skip oversized frame")?;
        if skipped < len as u64 {
            anyhow::bail!("Input ended inside an oversized frame");
        }
        return Ok(Some(Frame::Oversized(len)));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .context("Input ended inside a frame")?;
    Ok(Some(Frame::Body(body)))
}

pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME {
        anyhow::bail!("Frame of {} bytes exceeds the {} byte limit", body.len(), MAX_FRAME);
    }
    let len = u32::try_from(body.len()).context("Frame length overflow")?;
    writer.write_all(&len.to_ne_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

fn respond<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    let body = serde_json::to_vec(response)?;
    if body.len() > MAX_FRAME {
        warn!("response of {} bytes is too large for the browser", body.len());
        let fallback = serde_json::to_vec(&Response::error("Response too large"))?;
        return write_frame(writer, &fallback);
    }
    write_frame(writer, &body)
}

/// Answer frames until the browser closes the pipe.
pub fn serve<C, S, N, R, W>(engine: &mut SyncEngine<C, S, N>, reader: &mut R, writer: &mut W) -> Result<()>
where
    C: LocalCache,
    S: DocumentStore,
    N: Notifier,
    R: Read,
    W: Write,
{
    info!("native messaging host started");
    let mut handled = 0usize;
    while let Some(frame) = read_frame(reader)? {
        let response = match frame {
            Frame::Oversized(len) => {
                warn!("skipped {} byte frame", len);
                Response::error("Message too large")
            }
            Frame::Body(body) => match serde_json::from_slice::<Message>(&body) {
                Ok(message) => {
                    debug!("request {:?}", message);
                    engine.handle(message)
                }
                Err(e) => {
                    warn!("unreadable request: {}", e);
                    Response::error(format!("Invalid message: {}", e))
                }
            },
        };
        if !response.is_success() {
            debug!("request failed: {:?}", response);
        }
        respond(writer, &response)?;
        handled += 1;
    }
    info!("native messaging host done after {} requests", handled);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteCache;
    use crate::testing::{FixedClock, MemoryDocumentStore, RecordingNotifier};
    use serde_json::{json, Value};
    use std::io::Cursor;

    fn framed(values: &[Value]) -> Vec<u8> {
        let mut out = Vec::new();
        for value in values {
            write_frame(&mut out, &serde_json::to_vec(value).unwrap()).unwrap();
        }
        out
    }

    fn replies(mut out: &[u8]) -> Vec<Value> {
        let mut values = Vec::new();
        while let Some(Frame::Body(body)) = read_frame(&mut out).unwrap() {
            values.push(serde_json::from_slice(&body).unwrap());
        }
        values
    }

    #[test]
    fn test_frame_layout() {
        let mut out = Vec::new();
        write_frame(&mut out, b"{}").unwrap();
        assert_eq!(&out[..4], &2u32.to_ne_bytes());
        assert_eq!(&out[4..], b"{}");
    }

    #[test]
    fn test_eof_and_truncation() {
        assert_eq!(read_frame(&mut Cursor::new(Vec::new())).unwrap(), None);

        let mut truncated = 10u32.to_ne_bytes().to_vec();
        truncated.extend_from_slice(b"abc");
        assert!(read_frame(&mut Cursor::new(truncated)).is_err());
    }

    #[test]
    fn test_partial_header_is_an_error() {
        for cut in 1..4 {
            let header = 2u32.to_ne_bytes()[..cut].to_vec();
            assert!(read_frame(&mut Cursor::new(header)).is_err(), "cut at {}", cut);
        }
        // A frame followed by a stray byte fails only on the second read.
        let mut input = Vec::new();
        write_frame(&mut input, b"{}").unwrap();
        input.push(0);
        let mut cursor = Cursor::new(input);
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(Frame::Body(b"{}".to_vec())));
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_oversized_frame_is_skipped() {
        let len = MAX_FRAME + 1;
        let mut input = (len as u32).to_ne_bytes().to_vec();
        input.extend(std::iter::repeat(b' ').take(len));
        input.extend(framed(&[json!({"action": "refreshStats"})]));

        let mut cursor = Cursor::new(input);
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(Frame::Oversized(len)));
        assert!(matches!(read_frame(&mut cursor).unwrap(), Some(Frame::Body(_))));
    }

    #[test]
    fn test_serve_answers_each_frame() {
        let store = MemoryDocumentStore::new();
        let mut engine = SyncEngine::new(
            SqliteCache::open_in_memory().unwrap(),
            store.clone(),
            RecordingNotifier::default(),
            Box::new(FixedClock::at("2024-03-10T09:00:00Z")),
        );

        let mut input = framed(&[
            json!({"action": "getStats"}),
            json!({"action": "getStats", "userId": "u1"}),
        ]);
        // Malformed JSON gets an error reply instead of ending the host.
        write_frame(&mut input, b"{not json").unwrap();
        input.extend(framed(&[json!({"action": "refreshStats"})]));

        let mut output = Vec::new();
        serve(&mut engine, &mut Cursor::new(input), &mut output).unwrap();

        let out = replies(&output);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], json!({"success": false, "message": "No userId provided"}));
        assert_eq!(out[1]["success"], json!(true));
        assert_eq!(out[1]["stats"]["userId"], json!("u1"));
        assert_eq!(out[2]["status"], json!("error"));
        assert_eq!(out[3], json!({"status": "success"}));
        assert!(store.document("u1").is_some());
    }
}
