use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use outpost::buffer::{BufferContext, PollFdHandler, SmartBuffer};

/// Fresh temp directory per test so spill files from parallel tests never
/// collide and unlink checks stay meaningful.
fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("outpost_buf_{}_{}", std::process::id(), name));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn setup(name: &str, max_memory: usize) -> (Rc<RefCell<PollFdHandler>>, Rc<BufferContext>, PathBuf) {
    let dir = test_dir(name);
    let handler = Rc::new(RefCell::new(PollFdHandler::new()));
    let ctx = BufferContext::new(dir.clone(), max_memory, handler.clone());
    (handler, ctx, dir)
}

fn pump_writes(handler: &Rc<RefCell<PollFdHandler>>, buffer: &SmartBuffer) {
    let mut guard = 0;
    while buffer.pending_write_len() > 0 && !buffer.is_terminated() {
        handler.borrow_mut().poll_once(100).unwrap();
        guard += 1;
        assert!(guard < 10_000, "write queue never drained");
    }
}

fn pump_reads(handler: &Rc<RefCell<PollFdHandler>>, buffer: &SmartBuffer) {
    let mut guard = 0;
    while buffer.outstanding() > 0 && !buffer.is_terminated() {
        handler.borrow_mut().poll_once(100).unwrap();
        guard += 1;
        assert!(guard < 10_000, "outstanding reads never satisfied");
    }
}

#[test]
fn test_memory_mode_below_threshold() {
    let (_handler, ctx, dir) = setup("memory", 64);
    let buffer = SmartBuffer::new(&ctx);

    buffer.append(b"hello world");
    assert!(!buffer.is_file());
    assert_eq!(buffer.size(), 11);

    buffer.read(5);
    assert_eq!(&buffer.read_buffer()[..], b"hello");

    buffer.read(100);
    assert_eq!(&buffer.read_buffer()[..], b"hello world");

    buffer.clean_read_buffer(6);
    assert_eq!(&buffer.read_buffer()[..], b"world");

    // Over-length clean is capped, not a panic.
    buffer.clean_read_buffer(1000);
    assert_eq!(buffer.read_buffer().len(), 0);

    drop(buffer);
    fs::remove_dir(&dir).unwrap(); // stayed empty: nothing spilled
}

#[test]
fn test_spill_past_threshold() {
    let (handler, ctx, dir) = setup("spill", 64);
    let buffer = SmartBuffer::new(&ctx);

    let payload: Vec<u8> = (0..200u8).collect();
    buffer.append(&payload);

    assert!(buffer.is_file());
    // Everything is queued until the event loop drains it.
    assert_eq!(&buffer.write_buffer()[..], &payload[..]);
    pump_writes(&handler, &buffer);
    assert_eq!(buffer.size(), 200);
    assert!(!buffer.is_terminated());

    // The spill file exists under the configured directory.
    let spill_files: Vec<_> = fs::read_dir(&dir).unwrap().collect();
    assert_eq!(spill_files.len(), 1);
    let name = spill_files[0]
        .as_ref()
        .unwrap()
        .file_name()
        .into_string()
        .unwrap();
    assert!(name.starts_with("smartbuffer_"));

    // Read everything back through the readiness loop.
    buffer.read(200);
    pump_reads(&handler, &buffer);
    assert_eq!(&buffer.read_buffer()[..], &payload[..]);

    // Dropping the last handle unlinks the spill file.
    drop(buffer);
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    fs::remove_dir(&dir).unwrap();
}

#[test]
fn test_spilled_buffer_never_returns_to_memory() {
    let (handler, ctx, dir) = setup("no_revert", 16);
    let buffer = SmartBuffer::new(&ctx);

    buffer.append(&[0u8; 32]);
    assert!(buffer.is_file());

    pump_writes(&handler, &buffer);
    buffer.append(b"tiny");
    assert!(buffer.is_file(), "file mode must be one-way");
    assert!(buffer.memory_contents().is_none());

    pump_writes(&handler, &buffer);
    assert_eq!(buffer.size(), 36);

    drop(buffer);
    fs::remove_dir(&dir).unwrap();
}

#[test]
fn test_appends_interleaved_with_drains() {
    let (handler, ctx, dir) = setup("interleave", 8);
    let buffer = SmartBuffer::new(&ctx);

    for chunk in 0..10u8 {
        buffer.append(&[chunk; 10]);
        handler.borrow_mut().poll_once(100).unwrap();
    }
    pump_writes(&handler, &buffer);
    assert_eq!(buffer.size(), 100);

    buffer.read(100);
    pump_reads(&handler, &buffer);
    let data = buffer.read_buffer();
    assert_eq!(data.len(), 100);
    for (i, byte) in data.iter().enumerate() {
        assert_eq!(*byte, (i / 10) as u8);
    }

    drop(buffer);
    fs::remove_dir(&dir).unwrap();
}

#[test]
fn test_adopted_file_reads_without_unlinking() {
    let (handler, ctx, dir) = setup("adopt", 64);

    let path = dir.join("static.bin");
    let content: Vec<u8> = (0..100u8).collect();
    fs::File::create(&path)
        .unwrap()
        .write_all(&content)
        .unwrap();

    let buffer = SmartBuffer::from_file(&ctx, fs::File::open(&path).unwrap()).unwrap();
    assert!(buffer.is_file());
    assert_eq!(buffer.size(), 100);

    buffer.read(40);
    pump_reads(&handler, &buffer);
    assert_eq!(buffer.read_buffer().len(), 40);
    assert_eq!(&buffer.read_buffer()[..], &content[..40]);
    assert_eq!(buffer.outstanding(), 0);

    buffer.read(60);
    pump_reads(&handler, &buffer);
    assert_eq!(&buffer.read_buffer()[..], &content[..]);

    // Adopted descriptors are closed on drop but the path survives.
    drop(buffer);
    assert!(path.exists());
    assert_eq!(handler.borrow().len(), 0);

    fs::remove_file(&path).unwrap();
    fs::remove_dir(&dir).unwrap();
}

#[test]
fn test_read_past_eof_terminates() {
    let (handler, ctx, dir) = setup("eof", 64);

    let path = dir.join("short.bin");
    fs::File::create(&path).unwrap().write_all(&[7u8; 10]).unwrap();

    let buffer = SmartBuffer::from_file(&ctx, fs::File::open(&path).unwrap()).unwrap();
    buffer.read(20);

    let mut guard = 0;
    while !buffer.is_terminated() {
        handler.borrow_mut().poll_once(100).unwrap();
        guard += 1;
        assert!(guard < 10_000, "buffer never terminated");
    }

    // The 10 real bytes arrived before the EOF read killed the buffer.
    assert_eq!(buffer.read_buffer().len(), 10);
    assert_eq!(handler.borrow().len(), 0);

    drop(buffer);
    assert!(path.exists());
    fs::remove_file(&path).unwrap();
    fs::remove_dir(&dir).unwrap();
}

#[test]
fn test_shared_handles_release_on_last_drop() {
    let (handler, ctx, dir) = setup("shared", 16);
    let buffer = SmartBuffer::new(&ctx);
    buffer.append(&[1u8; 64]);
    pump_writes(&handler, &buffer);

    let other = buffer.clone();
    drop(buffer);
    // Still alive through the second handle.
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    assert_eq!(other.size(), 64);

    drop(other);
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    fs::remove_dir(&dir).unwrap();
}

#[test]
fn test_spill_counter_names_are_unique() {
    let (handler, ctx, dir) = setup("counter", 4);

    let a = SmartBuffer::new(&ctx);
    let b = SmartBuffer::new(&ctx);
    a.append(&[0u8; 16]);
    b.append(&[1u8; 16]);
    pump_writes(&handler, &a);
    pump_writes(&handler, &b);

    let mut names: Vec<String> = fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, ["smartbuffer_0", "smartbuffer_1"]);

    drop(a);
    drop(b);
    fs::remove_dir(&dir).unwrap();
}
