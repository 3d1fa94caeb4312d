//! DNS name (label sequence) codec, with pointer compression (RFC 1035 §4.1.4).
//!
//! Names compare case-insensitively on ASCII; the comparison key is the
//! lowercased dotted form with a trailing dot.

use std::collections::HashMap;

use crate::error::{Error, Result};

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_HOPS: usize = 16;
const POINTER_FLAG: u8 = 0xC0;

/// Lowercased, dotted, trailing-dot comparison key for a name.
pub fn key(name: &str) -> String {
    let mut k = name.to_ascii_lowercase();
    if !k.ends_with('.') {
        k.push('.');
    }
    k
}

/// Table of name suffixes already written into the current datagram,
/// keyed by lowercased suffix, mapping to their offset. Reset per
/// datagram — compression pointers are only valid within one message
/// (pointers only make sense within one datagram).
#[derive(Default, Clone)]
pub struct CompressionTable {
    offsets: HashMap<String, u16>,
}

impl CompressionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `name` into `buf`, substituting a compression pointer for any
    /// suffix already present at an offset that fits in 14 bits. Records
    /// the offset of every new suffix written so later names can point
    /// back into this one.
    pub fn encode(&mut self, name: &str, buf: &mut Vec<u8>) -> Result<()> {
        if name.len() > MAX_NAME_LEN {
            return Err(Error::MalformedName {
                offset: 0,
                reason: "name exceeds 255 bytes",
            });
        }

        let labels: Vec<&str> = if name.is_empty() || name == "." {
            Vec::new()
        } else {
            name.trim_end_matches('.').split('.').collect()
        };

        for (i, label) in labels.iter().enumerate() {
            if label.len() > MAX_LABEL_LEN {
                return Err(Error::MalformedName {
                    offset: 0,
                    reason: "label exceeds 63 bytes",
                });
            }

            let suffix = labels[i..].join(".").to_ascii_lowercase() + ".";
            if let Some(&ptr_offset) = self.offsets.get(&suffix) {
                buf.push(POINTER_FLAG | ((ptr_offset >> 8) as u8 & 0x3F));
                buf.push((ptr_offset & 0xFF) as u8);
                return Ok(());
            }

            if buf.len() <= 0x3FFF {
                self.offsets.insert(suffix, buf.len() as u16);
            }

            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }

        buf.push(0);
        Ok(())
    }
}

/// Encode a name with no compression (used for contexts — like RDATA of
/// some record types under strict decompression rules, or standalone
/// buffers — that don't share a datagram-wide table).
pub fn encode_uncompressed(name: &str, buf: &mut Vec<u8>) {
    let mut table = CompressionTable::new();
    // An isolated table never has prior suffixes, so this never compresses;
    // offsets recorded against `buf`'s start are discarded with the table.
    let _ = table.encode(name, buf);
}

/// Decode a name from `buf` starting at `offset`, following compression
/// pointers. Returns the dotted name and the offset immediately after the
/// name *as it appears at the start offset* (i.e. not following any jump).
pub fn decode(buf: &[u8], start: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut offset = start;
    let mut end_offset: Option<usize> = None;
    let mut hops = 0usize;
    let mut total_len = 0usize;

    loop {
        if offset >= buf.len() {
            return Err(Error::MalformedName {
                offset,
                reason: "truncated name",
            });
        }

        let len = buf[offset];

        if len & POINTER_FLAG == POINTER_FLAG {
            if offset + 1 >= buf.len() {
                return Err(Error::MalformedName {
                    offset,
                    reason: "truncated pointer",
                });
            }
            if end_offset.is_none() {
                end_offset = Some(offset + 2);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(Error::MalformedName {
                    offset,
                    reason: "compression loop",
                });
            }
            let target = (((len & 0x3F) as usize) << 8) | buf[offset + 1] as usize;
            if target >= offset {
                // Pointers must always point backwards; forward/self
                // pointers are the classic loop vector.
                return Err(Error::MalformedName {
                    offset,
                    reason: "compression loop",
                });
            }
            offset = target;
            continue;
        }

        if len == 0 {
            if end_offset.is_none() {
                end_offset = Some(offset + 1);
            }
            break;
        }

        if len > MAX_LABEL_LEN as u8 {
            return Err(Error::MalformedName {
                offset,
                reason: "label exceeds 63 bytes",
            });
        }

        let label_start = offset + 1;
        let label_end = label_start + len as usize;
        if label_end > buf.len() {
            return Err(Error::MalformedName {
                offset,
                reason: "truncated label",
            });
        }

        let label = std::str::from_utf8(&buf[label_start..label_end]).map_err(|_| Error::MalformedName {
            offset,
            reason: "invalid utf-8 in label",
        })?;
        total_len += label.len() + 1;
        if total_len > MAX_NAME_LEN {
            return Err(Error::MalformedName {
                offset,
                reason: "name exceeds 255 bytes",
            });
        }
        labels.push(label.to_string());
        offset = label_end;
    }

    let name = if labels.is_empty() {
        ".".to_string()
    } else {
        let mut s = labels.join(".");
        s.push('.');
        s
    };

    Ok((name, end_offset.unwrap()))
}
