use std::io::{BufRead, BufReader, Read};

use anyhow::{Context, Result, bail};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

/// Undoes the `content-encoding` of a response body, producing at most
/// `limit` bytes. Falls back to the raw bytes when the encoding is unknown
/// or the body doesn't decode.
pub fn decode_content(
    bytes: &[u8],
    content_encoding: Option<&str>,
    limit: usize,
) -> Vec<u8> {
    let raw = || bytes[..bytes.len().min(limit)].to_vec();
    let Some(content_encoding) = content_encoding else {
        return raw();
    };
    // Servers disagree on whether deflate carries a zlib header; retry as
    // raw deflate when the header sniff picked wrong.
    let decoded = decode_all(bytes, content_encoding, limit, true)
        .or_else(|_| decode_all(bytes, content_encoding, limit, false));
    match decoded {
        Ok(decoded) => decoded,
        Err(error) => {
            log::debug!(
                "keeping raw body, {} decoding failed: {:#}",
                content_encoding,
                error
            );
            raw()
        }
    }
}

fn decode_all(
    bytes: &[u8],
    content_encoding: &str,
    limit: usize,
    sniff_zlib: bool,
) -> Result<Vec<u8>> {
    // Codings are listed in the order they were applied.
    let mut reader: Box<dyn Read + '_> = Box::new(bytes);
    for coding in content_encoding.split(',').rev() {
        reader = decoder(reader, coding.trim(), sniff_zlib)?;
    }
    let mut decoded = Vec::new();
    reader
        .take(limit as u64)
        .read_to_end(&mut decoded)
        .with_context(|| format!("decode {}", content_encoding))?;
    Ok(decoded)
}

fn decoder<'a>(
    inner: Box<dyn Read + 'a>,
    coding: &str,
    sniff_zlib: bool,
) -> Result<Box<dyn Read + 'a>> {
    Ok(match coding.to_ascii_lowercase().as_str() {
        "" | "identity" => inner,
        "gzip" | "x-gzip" => Box::new(GzDecoder::new(inner)),
        "deflate" => {
            let mut inner = BufReader::new(inner);
            let zlib = sniff_zlib
                && has_zlib_header(inner.fill_buf().context("deflate")?);
            let decoder: Box<dyn Read + 'a> = if zlib {
                Box::new(ZlibDecoder::new(inner))
            } else {
                Box::new(DeflateDecoder::new(inner))
            };
            decoder
        }
        "br" => Box::new(brotli::Decompressor::new(inner, 4096)),
        other => bail!("unsupported content encoding: {}", other),
    })
}

fn has_zlib_header(head: &[u8]) -> bool {
    match head {
        [cmf, flg, ..] => {
            cmf & 0x0f == 8
                && ((u16::from(*cmf) << 8) | u16::from(*flg)) % 31 == 0
        }
        _ => false,
    }
}

/// Cuts `text` to at most `limit` bytes without splitting a character.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

pub fn capped_text(bytes: &[u8], limit: usize) -> String {
    truncate(&String::from_utf8_lossy(bytes), limit)
}

/// JSON, text, script and XML payloads are worth keeping.
pub fn is_textual(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    ["json", "text/", "javascript", "xml"]
        .iter()
        .any(|marker| content_type.contains(marker))
}
