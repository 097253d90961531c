//! Behavioural properties of the channel runtime, exercised end to end
//! through the public API and the in-memory drivers.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use layerio_core::{
    pipe, Buffering, Channel, ChannelError, Encoding, Interest, MemoryDriver, MemoryHandle,
    Runtime, SeekMode, Transform, TransformDriver, TransformResult, TransformVerb,
    TranslationMode,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn rw() -> Interest {
    Interest::READABLE | Interest::WRITABLE
}

fn writer(rt: &Runtime) -> (Channel, MemoryHandle) {
    let drv = MemoryDriver::empty();
    let handle = drv.handle();
    (rt.create_channel(drv, "out", Interest::WRITABLE), handle)
}

fn reader(rt: &Runtime, data: Vec<u8>) -> (Channel, MemoryHandle) {
    let drv = MemoryDriver::new(data);
    let handle = drv.handle();
    (rt.create_channel(drv, "in", Interest::READABLE), handle)
}

// ==============================================================
// Transforms used by the stacking tests
// ==============================================================

/// Doubles every byte read
struct Doubler;

impl Transform for Doubler {
    fn invoke(&mut self, verb: TransformVerb, payload: &[u8]) -> layerio_core::Result<TransformResult> {
        Ok(match verb {
            TransformVerb::Read => {
                let doubled: Vec<u8> = payload.iter().flat_map(|&b| [b, b]).collect();
                TransformResult::Buffer(Bytes::from(doubled))
            }
            TransformVerb::Write => TransformResult::Downstream(Bytes::copy_from_slice(payload)),
            _ => TransformResult::Discard,
        })
    }
}

/// Upper-cases every byte read
struct Shout;

impl Transform for Shout {
    fn invoke(&mut self, verb: TransformVerb, payload: &[u8]) -> layerio_core::Result<TransformResult> {
        Ok(match verb {
            TransformVerb::Read => TransformResult::Buffer(Bytes::from(payload.to_ascii_uppercase())),
            _ => TransformResult::Discard,
        })
    }
}

/// Passes bytes through unchanged
struct Identity;

impl Transform for Identity {
    fn invoke(&mut self, verb: TransformVerb, payload: &[u8]) -> layerio_core::Result<TransformResult> {
        Ok(match verb {
            TransformVerb::Read => TransformResult::Buffer(Bytes::copy_from_slice(payload)),
            TransformVerb::Write => TransformResult::Downstream(Bytes::copy_from_slice(payload)),
            _ => TransformResult::Discard,
        })
    }
}

// ==============================================================
// Output ordering
// ==============================================================

#[test]
fn test_write_order_survives_buffer_splits() {
    let mut rng = StdRng::seed_from_u64(7);
    for buffering in [Buffering::Line, Buffering::Full] {
        let rt = Runtime::new();
        let (ch, handle) = writer(&rt);
        ch.set_buffering(buffering).unwrap();
        ch.set_option("buffersize", "16").unwrap();
        ch.set_translation(TranslationMode::Lf).unwrap();

        let mut expected = Vec::new();
        for i in 0..200 {
            let len = rng.gen_range(0..40);
            let mut chunk: Vec<u8> = (0..len).map(|j| b'a' + ((i + j) % 26) as u8).collect();
            if rng.gen_bool(0.3) {
                chunk.push(b'\n');
            }
            ch.write(&chunk).unwrap();
            expected.extend_from_slice(&chunk);
        }
        ch.flush().unwrap();
        assert_eq!(handle.contents(), expected, "buffering {}", buffering);
    }
}

#[test]
fn test_crlf_output_order_with_tiny_buffers() {
    let rt = Runtime::new();
    let (ch, handle) = writer(&rt);
    ch.set_option("buffersize", "10").unwrap();
    ch.set_translation(TranslationMode::Crlf).unwrap();
    for _ in 0..50 {
        ch.write(b"ab\n").unwrap();
    }
    ch.flush().unwrap();
    assert_eq!(handle.contents(), b"ab\r\n".repeat(50));
}

// ==============================================================
// Round trips
// ==============================================================

#[test]
fn test_round_trip_over_modes_and_encodings() {
    let text = "héllo\nwörld\r\n\nlast line";
    // A lone \r would read back as a line ending in most modes.
    let text_no_cr = text.replace('\r', "");
    let encodings = [
        Encoding::Utf8,
        Encoding::Iso8859_1,
        Encoding::Utf16Le,
        Encoding::Utf16Be,
    ];
    let modes = [
        TranslationMode::Lf,
        TranslationMode::Cr,
        TranslationMode::Crlf,
    ];

    for encoding in encodings {
        for mode in modes {
            let rt = Runtime::new();
            let (out, handle) = writer(&rt);
            out.set_encoding(encoding).unwrap();
            out.set_translation(mode).unwrap();
            out.write_chars(&text_no_cr).unwrap();
            out.flush().unwrap();
            let stored = handle.contents();

            for read_mode in [mode, TranslationMode::Auto] {
                let (inp, _) = reader(&rt, stored.clone());
                inp.set_encoding(encoding).unwrap();
                inp.set_translation(read_mode).unwrap();
                assert_eq!(
                    inp.read_chars_to_end().unwrap(),
                    text_no_cr,
                    "encoding {} written {:?} read {:?}",
                    encoding,
                    mode,
                    read_mode
                );
            }
        }
    }
}

#[test]
fn test_binary_round_trip_is_byte_exact() {
    let mut rng = StdRng::seed_from_u64(11);
    let data: Vec<u8> = (0..5000).map(|_| rng.gen()).collect();
    let rt = Runtime::new();
    let (out, handle) = writer(&rt);
    out.set_translation(TranslationMode::Binary).unwrap();
    out.write(&data).unwrap();
    out.flush().unwrap();
    assert_eq!(handle.contents(), data);

    let (inp, _) = reader(&rt, handle.contents());
    inp.set_option("translation", "binary").unwrap();
    assert_eq!(inp.read_to_end().unwrap(), data);
}

// ==============================================================
// gets rollback
// ==============================================================

#[test]
fn test_gets_rollback_leaves_no_trace() {
    let rt = Runtime::new();
    let (tested_r, tested_w) = pipe(None);
    let (ctl_r, ctl_w) = pipe(None);
    let tested = rt.create_channel(tested_r, "tested", Interest::READABLE);
    let control = rt.create_channel(ctl_r, "control", Interest::READABLE);
    let tested_w = rt.create_channel(tested_w, "tested-w", Interest::WRITABLE);
    let ctl_w = rt.create_channel(ctl_w, "control-w", Interest::WRITABLE);
    tested.set_blocking(false).unwrap();
    control.set_blocking(false).unwrap();

    // Incomplete line ending in half of a UTF-8 sequence.
    let head = b"no newline yet \xc3";
    let tail = b"\xa9 done\nsecond\n";
    for w in [&tested_w, &ctl_w] {
        w.write(head).unwrap();
        w.flush().unwrap();
    }

    for _ in 0..3 {
        assert_eq!(tested.gets().unwrap(), None);
        assert!(tested.is_blocked());
        assert!(!tested.is_eof());
    }

    for w in [&tested_w, &ctl_w] {
        w.write(tail).unwrap();
        w.close().unwrap();
    }
    let from_tested = tested.read_to_end().unwrap();
    let controlled = control.read_to_end().unwrap();
    assert_eq!(from_tested, controlled);
    assert_eq!(from_tested, [&head[..], &tail[..]].concat());
}

// ==============================================================
// Boundary cases
// ==============================================================

#[test]
fn test_auto_cr_lf_split_across_reads() {
    let rt = Runtime::new();
    let (r, w) = pipe(None);
    let rd = rt.create_channel(r, "rd", Interest::READABLE);
    let wr = rt.create_channel(w, "wr", Interest::WRITABLE);
    rd.set_blocking(false).unwrap();
    wr.set_translation(TranslationMode::Lf).unwrap();

    wr.write(b"one\r").unwrap();
    wr.flush().unwrap();
    assert_eq!(rd.gets().unwrap().as_deref(), Some("one"));
    assert_eq!(rd.gets().unwrap(), None);

    // Some event-loop turns pass before the \n shows up.
    rt.notifier().run_pending();
    wr.write(b"\ntwo\n").unwrap();
    wr.flush().unwrap();
    assert_eq!(rd.gets().unwrap().as_deref(), Some("two"));
}

#[test]
fn test_auto_cr_lf_split_by_driver_bursts() {
    let rt = Runtime::new();
    let (ch, handle) = reader(&rt, b"one\r\ntwo\r\nthree".to_vec());
    handle.set_read_burst(Some(4));
    assert_eq!(ch.read_chars_to_end().unwrap(), "one\ntwo\nthree");
}

#[test]
fn test_multibyte_char_split_at_buffer_boundary() {
    let text = "abcdefghi€xyz\nsecond ünïcode line\n";
    let whole = {
        let rt = Runtime::new();
        let (ch, _) = reader(&rt, text.as_bytes().to_vec());
        ch.read_chars_to_end().unwrap()
    };
    assert_eq!(whole, text);

    for size in 10..20 {
        let rt = Runtime::new();
        let (ch, _) = reader(&rt, text.as_bytes().to_vec());
        ch.set_option("buffersize", &size.to_string()).unwrap();
        assert_eq!(ch.read_chars_to_end().unwrap(), whole, "buffersize {}", size);

        let (lines, _) = reader(&rt, text.as_bytes().to_vec());
        lines.set_option("buffersize", &size.to_string()).unwrap();
        assert_eq!(lines.gets().unwrap().as_deref(), Some("abcdefghi€xyz"));
        assert_eq!(lines.gets().unwrap().as_deref(), Some("second ünïcode line"));
    }
}

#[test]
fn test_utf16_split_at_odd_boundary() {
    let text = "odd boundary ✓ test";
    let encoded = Encoding::Utf16Le.encode_all(text);
    let rt = Runtime::new();
    let (ch, handle) = reader(&rt, encoded);
    ch.set_encoding(Encoding::Utf16Le).unwrap();
    handle.set_read_burst(Some(3));
    assert_eq!(ch.read_chars_to_end().unwrap(), text);
}

// ==============================================================
// Stacking
// ==============================================================

#[test]
fn test_doubling_layer_yields_twice_the_bytes() {
    let mut rng = StdRng::seed_from_u64(3);
    let data: Vec<u8> = (0..300).map(|_| rng.gen_range(b'a'..=b'z')).collect();
    let rt = Runtime::new();
    let (ch, handle) = reader(&rt, data.clone());
    ch.set_translation(TranslationMode::Binary).unwrap();
    ch.set_option("buffersize", "10").unwrap();
    ch.stack(TransformDriver::new(Doubler, Interest::READABLE).unwrap(), Interest::READABLE)
        .unwrap();

    // Each 10-byte raw read doubles into exactly two channel buffers, so
    // reading 40 bytes leaves nothing buffered in the layer or the channel.
    let n = 20;
    let got = ch.read(2 * n).unwrap();
    let expected: Vec<u8> = data[..n].iter().flat_map(|&b| [b, b]).collect();
    assert_eq!(got, expected);

    ch.unstack().unwrap();
    assert_eq!(ch.stack_depth(), 1);
    assert_eq!(handle.position(), n);
    assert_eq!(ch.read_to_end().unwrap(), &data[n..]);
}

#[test]
fn test_unstack_expanding_middle_layer_keeps_its_read_ahead() {
    let alphabet = b"abcdefghijklmnopqrstuvwxyz".to_vec();
    let rt = Runtime::new();
    let (ch, handle) = reader(&rt, alphabet.clone());
    ch.set_translation(TranslationMode::Binary).unwrap();
    ch.set_option("buffersize", "10").unwrap();
    ch.stack(TransformDriver::new(Doubler, Interest::READABLE).unwrap(), Interest::READABLE)
        .unwrap();
    ch.stack(TransformDriver::new(Identity, Interest::READABLE).unwrap(), Interest::READABLE)
        .unwrap();

    let first = ch.read(4).unwrap();
    assert_eq!(first, b"aabb");
    // The doubling layer consumed "abcdefghij" but only handed up half of
    // what it produced.
    assert_eq!(handle.position(), 10);

    ch.unstack_at(1).unwrap();
    assert_eq!(ch.layer_types(), vec!["memory", "transform"]);
    let rest = ch.read_to_end().unwrap();
    assert_eq!(rest, b"ccddeeffgghhiijjklmnopqrstuvwxyz");
}

#[test]
fn test_unstack_middle_layer_delivers_each_byte_once() {
    let alphabet = b"abcdefghijklmnopqrstuvwxyz".to_vec();
    let rt = Runtime::new();
    let (ch, _) = reader(&rt, alphabet.clone());
    ch.set_translation(TranslationMode::Binary).unwrap();
    ch.set_option("buffersize", "10").unwrap();
    ch.stack(TransformDriver::new(Shout, Interest::READABLE).unwrap(), Interest::READABLE)
        .unwrap();
    ch.stack(TransformDriver::new(Identity, Interest::READABLE).unwrap(), Interest::READABLE)
        .unwrap();
    assert_eq!(ch.stack_depth(), 3);

    let first = ch.read(3).unwrap();
    assert_eq!(first, b"ABC");

    ch.unstack_at(1).unwrap();
    assert_eq!(ch.layer_types(), vec!["memory", "transform"]);
    let rest = ch.read_to_end().unwrap();

    let all = [first, rest].concat();
    assert_eq!(all.len(), alphabet.len());
    assert_eq!(all.to_ascii_lowercase(), alphabet);
    // Everything read before the removal went through the upper-casing layer.
    assert!(all[..10].iter().all(u8::is_ascii_uppercase));
    assert!(all[10..].iter().all(u8::is_ascii_lowercase));
}

// ==============================================================
// EOF character
// ==============================================================

#[test]
fn test_eof_char_is_sticky_until_seek() {
    let rt = Runtime::new();
    let (ch, _) = reader(&rt, b"abc@def".to_vec());
    ch.set_option("eofchar", "@").unwrap();

    assert_eq!(ch.gets().unwrap().as_deref(), Some("abc"));
    assert!(ch.is_eof());
    assert!(ch.read_to_end().unwrap().is_empty());
    assert!(ch.is_eof());

    ch.seek(0, SeekMode::Start).unwrap();
    assert!(!ch.is_eof());
    assert_eq!(ch.read_to_end().unwrap(), b"abc");
    assert!(ch.is_eof());
}

// ==============================================================
// Background copy
// ==============================================================

#[test]
fn test_background_copy_of_bursty_source() {
    let mut rng = StdRng::seed_from_u64(42);
    let data: Vec<u8> = (0..10_000).map(|_| rng.gen()).collect();
    let mut bursts: Vec<usize> = (0..4).map(|_| rng.gen_range(1..=256)).collect();
    bursts.push(256);

    for burst in bursts {
        let rt = Runtime::new();
        let src = rt.create_channel(
            MemoryDriver::new(data.clone()).with_read_burst(burst),
            "src",
            Interest::READABLE,
        );
        let (dst, handle) = writer(&rt);
        src.set_translation(TranslationMode::Binary).unwrap();
        dst.set_translation(TranslationMode::Binary).unwrap();

        let calls: Rc<RefCell<Vec<(u64, Option<String>)>>> = Rc::new(RefCell::new(Vec::new()));
        let c = calls.clone();
        src.copy_to_background(&dst, None, move |total, err| {
            c.borrow_mut().push((total, err.map(|e| e.to_string())));
        })
        .unwrap();

        let done = calls.clone();
        assert!(rt.run_until(move || !done.borrow().is_empty(), Some(Duration::from_secs(20))));
        rt.notifier().run_pending();
        assert_eq!(*calls.borrow(), vec![(10_000, None)], "burst {}", burst);
        assert_eq!(handle.contents(), data, "burst {}", burst);
    }
}

#[test]
fn test_channel_busy_while_copying() {
    let rt = Runtime::new();
    let (src, _) = reader(&rt, b"data".to_vec());
    let (dst, _) = writer(&rt);
    src.copy_to_background(&dst, None, |_, _| {}).unwrap();
    assert!(matches!(src.gets(), Err(ChannelError::Busy)));
    assert!(matches!(dst.flush(), Err(ChannelError::Busy)));
    assert!(matches!(src.set_option("buffersize", "100"), Err(ChannelError::Busy)));
    assert_eq!(src.get_option("buffersize").unwrap(), "4096");
    assert_eq!(ChannelError::Busy.errno_name(), "EBUSY");
}
