use std::io::Cursor;

use camfeed::pipeline::{FrameStore, HuffmanScan};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

fn encode_test_image() -> Vec<u8> {
    let mut pixels = Vec::with_capacity((WIDTH * HEIGHT * 3) as usize);
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            pixels.extend_from_slice(&[(x * 4) as u8, (y * 5) as u8, ((x + y) * 2) as u8]);
        }
    }
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 80)
        .encode(&pixels, WIDTH, HEIGHT, ExtendedColorType::Rgb8)
        .unwrap();
    out
}

/// Drop every DHT segment, the way many MJPEG cameras send their frames.
fn strip_huffman_tables(jpeg: &[u8]) -> Vec<u8> {
    assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    let mut out = jpeg[..2].to_vec();
    let mut pos = 2;
    loop {
        assert_eq!(jpeg[pos], 0xff, "marker expected at {pos}");
        let marker = jpeg[pos + 1];
        if marker == 0xda {
            out.extend_from_slice(&jpeg[pos..]);
            return out;
        }
        let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        if marker != 0xc4 {
            out.extend_from_slice(&jpeg[pos..pos + 2 + len]);
        }
        pos += 2 + len;
    }
}

fn decode(jpeg: &[u8]) -> Vec<u8> {
    jpeg_decoder::Decoder::new(Cursor::new(jpeg)).decode().unwrap()
}

#[test]
fn test_repaired_frame_decodes_like_original() {
    let original = encode_test_image();
    assert!(matches!(camfeed::pipeline::repair::scan(&original), HuffmanScan::Present));

    let stripped = strip_huffman_tables(&original);
    assert!(stripped.len() < original.len());
    assert!(matches!(
        camfeed::pipeline::repair::scan(&stripped),
        HuffmanScan::MissingAt(_)
    ));

    let store: FrameStore<Vec<u8>> = FrameStore::new();
    store.publish(stripped).unwrap();
    let (repaired, was_repaired) = store
        .read_current(|frame| (frame.to_bytes(), frame.is_repaired()))
        .unwrap();
    assert!(was_repaired);

    assert_eq!(decode(&repaired), decode(&original));
}

#[test]
fn test_complete_jpeg_passes_through_untouched() {
    let original = encode_test_image();
    let store: FrameStore<Vec<u8>> = FrameStore::new();
    store.publish(original.clone()).unwrap();

    let bytes = store.read_current(|frame| frame.to_bytes()).unwrap();
    assert_eq!(&bytes[..], &original[..]);
}
