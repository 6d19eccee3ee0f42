/// Shortest buffer that can hold a start code, a NAL header and any payload
/// worth decoding. Shorter buffers are ignored.
///
/// The same value is used as the tail guard: start codes inside the last
/// `MIN_SCAN_LEN` bytes are not matched, so reading the NAL header byte after
/// a prefix never goes out of bounds.
pub const MIN_SCAN_LEN: usize = 10;

const START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

/// H.264 `nal_unit_type` values (ITU-T H.264 Table 7-1) relevant to feeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NalType {
    /// Coded slice of a non-IDR picture (1).
    Slice,
    /// Coded slice of an IDR picture (5), a synchronization point.
    Idr,
    /// Supplemental enhancement information (6).
    Sei,
    /// Sequence parameter set (7).
    Sps,
    /// Picture parameter set (8).
    Pps,
    /// Access unit delimiter (9).
    AccessUnitDelimiter,
    /// Any other 5-bit type value.
    Other(u8),
}

impl NalType {
    /// Decode the low 5 bits of a NAL header byte.
    pub fn from_header(header: u8) -> Self {
        match header & 0x1f {
            1 => Self::Slice,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::AccessUnitDelimiter,
            other => Self::Other(other),
        }
    }

    /// The raw 5-bit type value.
    pub fn value(self) -> u8 {
        match self {
            Self::Slice => 1,
            Self::Idr => 5,
            Self::Sei => 6,
            Self::Sps => 7,
            Self::Pps => 8,
            Self::AccessUnitDelimiter => 9,
            Self::Other(v) => v,
        }
    }

    /// Whether this unit carries codec configuration (SPS or PPS).
    pub fn is_parameter_set(self) -> bool {
        matches!(self, Self::Sps | Self::Pps)
    }
}

/// One NAL unit located inside a scanned buffer.
///
/// `data` holds the unit's bytes *including* its start code prefix, spanning
/// from [`offset`](Self::offset) up to the next unit's offset (or the end of
/// the buffer). This is the exact byte range a decoder input slot receives.
///
/// ```text
///   offset        header_offset
///     |                 |
///     v                 v
///     00 00 00 01      65 88 84 ...      00 00 01 41 ...
///     \_header_size_/  \__ nal() ___/    ^ next offset
///     \__________ data() ____________/
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaluSegment {
    nal_type: u8,
    header_size: u8,
    offset: usize,
    data: Vec<u8>,
}

impl NaluSegment {
    /// Raw 5-bit `nal_unit_type`.
    pub fn nal_type(&self) -> u8 {
        self.nal_type
    }

    pub fn kind(&self) -> NalType {
        NalType::from_header(self.nal_type)
    }

    /// Start code prefix length: 3 or 4.
    pub fn header_size(&self) -> usize {
        self.header_size as usize
    }

    /// Offset of the start code prefix in the scanned buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Offset of the first byte after the start code prefix.
    pub fn header_offset(&self) -> usize {
        self.offset + self.header_size()
    }

    /// Unit bytes, start code prefix included.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Unit bytes after the start code prefix (NAL header onwards).
    pub fn nal(&self) -> &[u8] {
        let start = self.header_size().min(self.data.len());
        &self.data[start..]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A start code whose end boundary is not known yet.
struct OpenSegment {
    nal_type: u8,
    header_size: u8,
    offset: usize,
}

impl OpenSegment {
    fn close(self, buffer: &[u8], end: usize) -> NaluSegment {
        NaluSegment {
            nal_type: self.nal_type,
            header_size: self.header_size,
            offset: self.offset,
            data: buffer[self.offset..end].to_vec(),
        }
    }
}

/// Split an Annex B buffer into NAL units, in stream order.
///
/// Scans once for the 3-byte `00 00 01` pattern. A match preceded by an
/// extra `0x00` is reported as a 4-byte prefix starting one byte earlier.
/// Each unit extends to the next unit's prefix, so concatenating the
/// returned [`data`](NaluSegment::data) reproduces the buffer from the first
/// start code onwards.
///
/// Buffers shorter than [`MIN_SCAN_LEN`] and buffers without a start code
/// yield an empty vector. Back-to-back start codes are not merged; they
/// produce units with no payload after the header byte.
pub fn scan(buffer: &[u8]) -> Vec<NaluSegment> {
    let len = buffer.len();
    let mut segments = Vec::new();

    if len < MIN_SCAN_LEN {
        tracing::trace!(len, "buffer too short to contain a NAL unit");
        return segments;
    }

    let mut open: Option<OpenSegment> = None;

    for i in 0..len - MIN_SCAN_LEN {
        if buffer[i..i + 3] != START_CODE {
            continue;
        }

        let nal_type = buffer[i + 3] & 0x1f;
        let (offset, header_size) = if i > 0 && buffer[i - 1] == 0x00 {
            (i - 1, 4)
        } else {
            (i, 3)
        };

        if let Some(prev) = open.take() {
            segments.push(prev.close(buffer, offset));
        }
        open = Some(OpenSegment {
            nal_type,
            header_size,
            offset,
        });
    }

    if let Some(last) = open {
        segments.push(last.close(buffer, len));
    }

    tracing::trace!(len, nal_count = segments.len(), "buffer scanned");

    segments
}
