//! Huffman table repair for MJPEG frames.
//!
//! Most UVC webcams stream MJPEG frames without a DHT segment and rely on
//! the decoder knowing the standard tables from ITU T.81 Annex K. Plain JPEG
//! decoders (browsers in particular) reject such frames, so the standard
//! tables are spliced in just before the start-of-scan marker.

/// DHT segment carrying the four standard Annex K tables
/// (luminance/chrominance, DC/AC).
pub static STANDARD_DHT: [u8; 420] = [
    0xff, 0xc4, 0x01, 0xa2, 0x00, 0x00, 0x01, 0x05, 0x01, 0x01, 0x01, 0x01,
    0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02,
    0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x01, 0x00, 0x03,
    0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09,
    0x0a, 0x0b, 0x10, 0x00, 0x02, 0x01, 0x03, 0x03, 0x02, 0x04, 0x03, 0x05,
    0x05, 0x04, 0x04, 0x00, 0x00, 0x01, 0x7d, 0x01, 0x02, 0x03, 0x00, 0x04,
    0x11, 0x05, 0x12, 0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61, 0x07, 0x22,
    0x71, 0x14, 0x32, 0x81, 0x91, 0xa1, 0x08, 0x23, 0x42, 0xb1, 0xc1, 0x15,
    0x52, 0xd1, 0xf0, 0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0a, 0x16, 0x17,
    0x18, 0x19, 0x1a, 0x25, 0x26, 0x27, 0x28, 0x29, 0x2a, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4a,
    0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63, 0x64, 0x65, 0x66,
    0x67, 0x68, 0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a,
    0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95,
    0x96, 0x97, 0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8,
    0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2,
    0xc3, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3, 0xd4, 0xd5,
    0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe1, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7,
    0xe8, 0xe9, 0xea, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9,
    0xfa, 0x11, 0x00, 0x02, 0x01, 0x02, 0x04, 0x04, 0x03, 0x04, 0x07, 0x05,
    0x04, 0x04, 0x00, 0x01, 0x02, 0x77, 0x00, 0x01, 0x02, 0x03, 0x11, 0x04,
    0x05, 0x21, 0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61, 0x71, 0x13, 0x22,
    0x32, 0x81, 0x08, 0x14, 0x42, 0x91, 0xa1, 0xb1, 0xc1, 0x09, 0x23, 0x33,
    0x52, 0xf0, 0x15, 0x62, 0x72, 0xd1, 0x0a, 0x16, 0x24, 0x34, 0xe1, 0x25,
    0xf1, 0x17, 0x18, 0x19, 0x1a, 0x26, 0x27, 0x28, 0x29, 0x2a, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4a,
    0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63, 0x64, 0x65, 0x66,
    0x67, 0x68, 0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a,
    0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8a, 0x92, 0x93, 0x94,
    0x95, 0x96, 0x97, 0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7,
    0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba,
    0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3, 0xd4,
    0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7,
    0xe8, 0xe9, 0xea, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa,
];

const MARKER: u8 = 0xff;
const DHT: u8 = 0xc4;
const SOS: u8 = 0xda;

/// Outcome of scanning a frame for its Huffman tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuffmanScan {
    /// A DHT marker appears before the start of scan.
    Present,
    /// Start of scan at this offset with no DHT before it.
    MissingAt(usize),
    /// Neither marker was found. Not a JPEG, or a truncated one.
    NoScanMarker,
}

impl HuffmanScan {
    /// Offset at which [`STANDARD_DHT`] has to be spliced in, if any.
    pub fn insert_offset(self) -> Option<usize> {
        match self {
            Self::MissingAt(offset) => Some(offset),
            Self::Present | Self::NoScanMarker => None,
        }
    }
}

/// Find where a frame needs its Huffman tables, stopping at the first DHT or
/// SOS marker.
pub fn scan(data: &[u8]) -> HuffmanScan {
    for (offset, pair) in data.windows(2).enumerate() {
        if pair[0] != MARKER {
            continue;
        }
        match pair[1] {
            DHT => return HuffmanScan::Present,
            SOS => return HuffmanScan::MissingAt(offset),
            _ => {}
        }
    }
    HuffmanScan::NoScanMarker
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_dht_is_a_complete_segment() {
        assert_eq!(&STANDARD_DHT[..2], &[MARKER, DHT]);
        let declared = u16::from_be_bytes([STANDARD_DHT[2], STANDARD_DHT[3]]) as usize;
        // Segment length counts itself but not the marker.
        assert_eq!(declared + 2, STANDARD_DHT.len());
    }

    #[test]
    fn test_scan_finds_missing_tables() {
        let mut frame = vec![0u8; 50];
        frame[0] = 0xff;
        frame[1] = 0xd8;
        frame[20] = 0xff;
        frame[21] = 0xda;
        assert_eq!(scan(&frame), HuffmanScan::MissingAt(20));
        assert_eq!(scan(&frame).insert_offset(), Some(20));
    }

    #[test]
    fn test_scan_tables_already_present() {
        let mut frame = vec![0u8; 64];
        frame[10] = 0xff;
        frame[11] = 0xc4;
        frame[40] = 0xff;
        frame[41] = 0xda;
        assert_eq!(scan(&frame), HuffmanScan::Present);
        assert_eq!(scan(&frame).insert_offset(), None);
    }

    #[test]
    fn test_scan_without_markers() {
        assert_eq!(scan(&[0u8; 100]), HuffmanScan::NoScanMarker);
        assert_eq!(scan(&[]), HuffmanScan::NoScanMarker);
        assert_eq!(scan(&[0xff]), HuffmanScan::NoScanMarker);
        // A lone 0xff right at the end must not be read past.
        assert_eq!(scan(&[0x00, 0x00, 0xff]), HuffmanScan::NoScanMarker);
    }

    #[test]
    fn test_scan_stops_at_first_marker() {
        // Tables after the scan marker do not count.
        let frame = [0xff, 0xd8, 0xff, 0xda, 0x00, 0xff, 0xc4];
        assert_eq!(scan(&frame), HuffmanScan::MissingAt(2));
    }
}
