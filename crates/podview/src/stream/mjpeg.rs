//! Motion-JPEG parsing
//!
//! Incremental parser for `multipart/x-mixed-replace` bodies. Parts carrying
//! a `Content-Length` header are read exactly; parts without one run until
//! the next boundary. A body without a usable boundary is scanned for JPEG
//! start/end markers instead.

use tracing::debug;

use crate::config::mjpeg::{BUFFER_TRIM_SIZE, MAX_BUFFER_SIZE, MAX_PART_HEADER_SIZE};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const HEADER_END: &[u8] = b"\r\n\r\n";

/// One received part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Position of this part in its response body, starting at 0
    pub sequence: u64,
    pub data: Vec<u8>,
    /// Width and height read from the JPEG frame header
    pub dimensions: Option<(u16, u16)>,
}

impl Frame {
    fn new(sequence: u64, data: Vec<u8>) -> Self {
        let dimensions = jpeg_dimensions(&data);
        Self {
            sequence,
            data,
            dimensions,
        }
    }

    /// False for zero-length or undecodable parts
    pub fn has_content(&self) -> bool {
        self.dimensions.is_some()
    }
}

/// Extract the multipart boundary from a `Content-Type` header value
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    let mime = parts.next()?.trim().to_ascii_lowercase();
    if !mime.starts_with("multipart/") {
        return None;
    }
    parts.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartState {
    SeekBoundary,
    Headers,
    Body { content_length: Option<usize> },
}

/// Incremental multipart JPEG parser
pub struct MultipartParser {
    /// Delimiter line, i.e. `--` followed by the boundary. `None` selects
    /// marker scanning.
    delimiter: Option<Vec<u8>>,
    buffer: Vec<u8>,
    /// Offset below which the pending search already failed
    scan_from: usize,
    state: PartState,
    sequence: u64,
}

impl MultipartParser {
    /// Parser for a multipart body with the given boundary
    pub fn with_boundary(boundary: &str) -> Self {
        // Some servers put the leading dashes in the header parameter as well
        let delimiter = if boundary.starts_with("--") {
            boundary.as_bytes().to_vec()
        } else {
            format!("--{boundary}").into_bytes()
        };
        Self {
            delimiter: Some(delimiter),
            buffer: Vec::new(),
            scan_from: 0,
            state: PartState::SeekBoundary,
            sequence: 0,
        }
    }

    /// Parser that ignores part framing and scans for JPEG markers
    pub fn marker_scan() -> Self {
        Self {
            delimiter: None,
            buffer: Vec::new(),
            scan_from: 0,
            state: PartState::SeekBoundary,
            sequence: 0,
        }
    }

    /// Pick the parser matching a response `Content-Type`
    pub fn for_content_type(content_type: Option<&str>) -> Self {
        match content_type.and_then(boundary_from_content_type) {
            Some(boundary) => Self::with_boundary(&boundary),
            None => Self::marker_scan(),
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.delimiter.is_some()
    }

    /// Bytes waiting for more input
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed a chunk of body bytes, returning every part it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let frames = match self.delimiter.clone() {
            Some(delimiter) => self.parse_parts(&delimiter),
            None => self.scan_markers(),
        };
        self.enforce_cap();
        frames
    }

    fn next_frame(&mut self, data: Vec<u8>) -> Frame {
        let frame = Frame::new(self.sequence, data);
        self.sequence += 1;
        frame
    }

    fn parse_parts(&mut self, delimiter: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            match self.state {
                PartState::SeekBoundary => match find(&self.buffer, delimiter) {
                    Some(pos) => {
                        self.buffer.drain(..pos + delimiter.len());
                        self.state = PartState::Headers;
                    }
                    None => {
                        // Keep a tail that may hold the start of a split delimiter
                        let keep = delimiter.len().saturating_sub(1);
                        if self.buffer.len() > keep {
                            let cut = self.buffer.len() - keep;
                            self.buffer.drain(..cut);
                        }
                        break;
                    }
                },
                PartState::Headers => {
                    if self.buffer.len() < 2 {
                        break;
                    }
                    if self.buffer.starts_with(b"--") {
                        // Closing delimiter
                        self.buffer.clear();
                        self.scan_from = 0;
                        self.state = PartState::SeekBoundary;
                        break;
                    }
                    // The block includes the CRLF ending the delimiter line
                    let Some(block_end) = self.find_resumable(HEADER_END, 0) else {
                        if self.buffer.len() > MAX_PART_HEADER_SIZE {
                            debug!(len = self.buffer.len(), "Oversized part header, resyncing");
                            self.scan_from = 0;
                            self.state = PartState::SeekBoundary;
                            continue;
                        }
                        break;
                    };
                    let content_length = parse_content_length(&self.buffer[..block_end]);
                    self.buffer.drain(..block_end + HEADER_END.len());
                    self.state = PartState::Body { content_length };
                }
                PartState::Body {
                    content_length: Some(len),
                } => {
                    if self.buffer.len() < len {
                        break;
                    }
                    let data: Vec<u8> = self.buffer.drain(..len).collect();
                    frames.push(self.next_frame(data));
                    self.state = PartState::SeekBoundary;
                }
                PartState::Body {
                    content_length: None,
                } => match self.find_resumable(delimiter, 0) {
                    Some(pos) => {
                        let mut data: Vec<u8> = self.buffer.drain(..pos).collect();
                        if data.ends_with(b"\r\n") {
                            data.truncate(data.len() - 2);
                        }
                        frames.push(self.next_frame(data));
                        self.state = PartState::SeekBoundary;
                    }
                    None => break,
                },
            }
        }
        frames
    }

    fn scan_markers(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let Some(start) = find(&self.buffer, &SOI) else {
                // A lone trailing 0xFF may be the first half of the next SOI
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                let cut = self.buffer.len() - keep;
                self.buffer.drain(..cut);
                self.scan_from = 0;
                break;
            };
            if start > 0 {
                self.buffer.drain(..start);
                self.scan_from = 0;
            }
            let Some(end) = self.find_resumable(&EOI, SOI.len()) else {
                break;
            };
            let data: Vec<u8> = self.buffer.drain(..end + EOI.len()).collect();
            frames.push(self.next_frame(data));
        }
        frames
    }

    /// Find `needle` at or after `floor`, resuming where the previous miss
    /// left off so a part arriving in many chunks is scanned once
    fn find_resumable(&mut self, needle: &[u8], floor: usize) -> Option<usize> {
        let from = self.scan_from.max(floor);
        match self.buffer.get(from..).and_then(|rest| find(rest, needle)) {
            Some(pos) => {
                self.scan_from = 0;
                Some(from + pos)
            }
            None => {
                // A match may still start within the last needle.len() - 1 bytes
                let overlap = needle.len().saturating_sub(1);
                self.scan_from = self.buffer.len().saturating_sub(overlap).max(from);
                None
            }
        }
    }

    fn enforce_cap(&mut self) {
        if self.buffer.len() > MAX_BUFFER_SIZE {
            debug!(len = self.buffer.len(), "Parse buffer over limit, trimming");
            let cut = self.buffer.len() - BUFFER_TRIM_SIZE;
            self.buffer.drain(..cut);
            self.scan_from = 0;
            if self.delimiter.is_some() {
                self.state = PartState::SeekBoundary;
            }
        }
    }
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let text = String::from_utf8_lossy(headers);
    text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read width and height from the first JPEG frame header (SOFn marker).
///
/// Returns `None` for data that is not a JPEG, has no frame header before
/// the scan data, or declares a zero dimension.
pub fn jpeg_dimensions(data: &[u8]) -> Option<(u16, u16)> {
    if !data.starts_with(&SOI) {
        return None;
    }
    let be16 = |i: usize| -> Option<u16> {
        Some(u16::from_be_bytes([*data.get(i)?, *data.get(i + 1)?]))
    };

    let mut i = 2;
    loop {
        if *data.get(i)? != 0xFF {
            return None;
        }
        // Fill bytes
        while *data.get(i + 1)? == 0xFF {
            i += 1;
        }
        let marker = *data.get(i + 1)?;
        match marker {
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                let height = be16(i + 5)?;
                let width = be16(i + 7)?;
                return (width > 0 && height > 0).then_some((width, height));
            }
            0xD9 | 0xDA => return None,
            0x01 | 0xD0..=0xD7 => i += 2,
            _ => {
                let len = usize::from(be16(i + 2)?);
                if len < 2 {
                    return None;
                }
                i += 2 + len;
            }
        }
    }
}
