use flate2::write::ZlibEncoder;
use flate2::Compression;
use rpakit::depot::{pair_candidates, ArchiveHandle};
use rpakit::pipeline::{self, prepare, DepotLifecycle, Options, Prepared, RunError, Task};
use rpakit::{FormatId, Segment};
use serde_pickle::{HashableValue, SerOptions, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

/// `RPA-3.0 <16 hex> <8 hex>\n` and `ALT-1.0 <8 hex> <16 hex>\n` are both 34 bytes.
const HEADER_LEN: usize = 34;

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn pickled(entries: &[(HashableValue, Vec<Value>)]) -> Vec<u8> {
    let map: BTreeMap<_, _> = entries
        .iter()
        .map(|(k, v)| (k.clone(), Value::List(v.clone())))
        .collect();
    serde_pickle::value_to_vec(&Value::Dict(map), SerOptions::new()).unwrap()
}

/// Archive contents laid out after a fixed-size header.
struct Builder {
    key:     u64,
    body:    Vec<u8>,
    entries: Vec<(HashableValue, Vec<Value>)>,
}

impl Builder {
    fn new(key: u64) -> Self {
        Self { key, body: Vec::new(), entries: Vec::new() }
    }

    fn pair(&self, offset: u64, length: u64) -> Value {
        Value::Tuple(vec![Value::I64((offset ^ self.key) as i64), Value::I64((length ^ self.key) as i64)])
    }

    fn file(mut self, path: &str, data: &[u8]) -> Self {
        let offset = (HEADER_LEN + self.body.len()) as u64;
        self.body.extend_from_slice(data);
        let seg = self.pair(offset, data.len() as u64);
        self.entries.push((HashableValue::String(path.into()), vec![seg]));
        self
    }

    /// Store `data` and claim `prefix` in front of it.
    fn prefixed(mut self, path: &str, prefix: &[u8], data: &[u8]) -> Self {
        let offset = (HEADER_LEN + self.body.len()) as u64;
        self.body.extend_from_slice(data);
        let length = (prefix.len() + data.len()) as u64;
        let seg = Value::Tuple(vec![
            Value::I64((offset ^ self.key) as i64),
            Value::I64((length ^ self.key) as i64),
            Value::Bytes(prefix.to_vec()),
        ]);
        self.entries.push((HashableValue::Bytes(path.as_bytes().to_vec()), vec![seg]));
        self
    }

    fn raw(mut self, path: &str, segments: Vec<Value>) -> Self {
        self.entries.push((HashableValue::String(path.into()), segments));
        self
    }

    fn index_offset(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    fn finish(self, header: String) -> Vec<u8> {
        assert_eq!(header.len(), HEADER_LEN);
        let mut out = header.into_bytes();
        out.extend(&self.body);
        out.extend(deflate(&pickled(&self.entries)));
        out
    }

    fn rpa3(self, key_text: &str) -> Vec<u8> {
        let header = format!("RPA-3.0 {:016x} {}\n", self.index_offset(), key_text);
        self.finish(header)
    }

    fn alt1(self) -> Vec<u8> {
        let header = format!("ALT-1.0 {:08x} {:016x}\n", self.key ^ 0xDABE_8DF0, self.index_offset());
        self.finish(header)
    }
}

fn write(dir: &Path, name: &str, bytes: &[u8]) {
    let path = dir.join(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

fn options(task: Task, out: &Path) -> Options {
    Options { task, destination: Some(out.to_path_buf()), json: false }
}

fn prepared(path: &Path) -> rpakit::pipeline::DepotState {
    let depot = pair_candidates(vec![ArchiveHandle::new(path)]).remove(0);
    match prepare(depot).unwrap() {
        Prepared::Ready(state) => state,
        Prepared::Skipped { outcome, .. } => panic!("skipped: {outcome}"),
    }
}

// ── Decoding ────────────────────────────────────────────────────────────────

#[test]
fn test_standard_header_end_to_end() {
    // Index right after the header; one entry `(0, 5)` scrambled with 0xFF.
    let dir = TempDir::new().unwrap();
    let archive = Builder::new(0xFF)
        .raw("a/b.txt", vec![Value::Tuple(vec![Value::I64(0xFF), Value::I64(5 ^ 0xFF)])])
        .rpa3("000000FF");
    assert!(archive.starts_with(b"RPA-3.0 0000000000000022 000000FF\n"));
    write(dir.path(), "game.rpa", &archive);

    let mut state = prepared(&dir.path().join("game.rpa"));
    assert_eq!(state.format.id, FormatId::Rpa3);
    assert_eq!((state.cipher.offset, state.cipher.key), (0x22, Some(0xFF)));
    assert_eq!(state.register.len(), 1);
    assert_eq!(state.register.get("a/b.txt").unwrap(), &[Segment::new(0, 5, Vec::new())]);

    let out = TempDir::new().unwrap();
    let tally = state.extract_to(out.path()).unwrap();
    assert_eq!(tally.written, 1);
    assert_eq!(fs::read(out.path().join("a/b.txt")).unwrap(), b"RPA-3");
    assert_eq!(state.lifecycle(), DepotLifecycle::Extracted);
}

#[test]
fn test_reversed_key_archive_is_relabelled() {
    let dir = TempDir::new().unwrap();
    let archive = Builder::new(0x4242_4242).file("script.rpy", b"label start:").rpa3("24242424");
    write(dir.path(), "scripts.rpa", &archive);

    let mut state = prepared(&dir.path().join("scripts.rpa"));
    assert_eq!(state.format.id, FormatId::Rpa3r);
    assert_eq!(state.cipher.key, Some(0x4242_4242));
    assert_eq!(state.test().id, FormatId::Rpa3r);
    assert_eq!(state.lifecycle(), DepotLifecycle::Tested);
}

#[test]
fn test_alt1_secondary_key() {
    let dir = TempDir::new().unwrap();
    let archive = Builder::new(0x1234).file("x.png", b"\x89PNG").alt1();
    write(dir.path(), "alt.rpa", &archive);

    let state = prepared(&dir.path().join("alt.rpa"));
    assert_eq!(state.format.id, FormatId::Alt1);
    assert_eq!(state.cipher.key, Some(0x1234));
    assert_eq!(state.register.get("x.png").unwrap()[0].length, 4);
}

#[test]
fn test_paired_index_reads_data_sibling() {
    let dir = TempDir::new().unwrap();
    let data = b"first-second";
    let index = pickled(&[
        (
            HashableValue::Bytes(b"one.txt".to_vec()),
            vec![Value::Tuple(vec![Value::I64(0), Value::I64(6)])],
        ),
        (
            HashableValue::Bytes(b"two.txt".to_vec()),
            vec![Value::Tuple(vec![Value::I64(6), Value::I64(6)])],
        ),
    ]);
    write(dir.path(), "legacy.rpi", &deflate(&index));
    write(dir.path(), "legacy.rpa", data);

    let out = dir.path().join("unpacked");
    let report = pipeline::run(dir.path(), &options(Task::Extract, &out)).unwrap();

    assert_eq!(report.found, 1);
    assert_eq!(report.depots[0].format, Some(FormatId::Rpa1));
    assert!(report.depots[0].path.ends_with("legacy.rpi"));
    assert_eq!(fs::read(out.join("one.txt")).unwrap(), b"first-");
    assert_eq!(fs::read(out.join("two.txt")).unwrap(), b"second");
}

// ── Runs ────────────────────────────────────────────────────────────────────

#[test]
fn test_extract_directory_run() {
    let dir = TempDir::new().unwrap();
    let images = Builder::new(0xFF)
        .file("images/bg.png", b"png-bytes")
        .prefixed("images/logo.png", b"\x89P", b"NG-rest")
        .file("../escape.txt", b"nope")
        .rpa3("000000ff");
    write(dir.path(), "game/images.rpa", &images);
    let audio = Builder::new(0x4242_4242).file("audio/theme.ogg", b"OggS").rpa3("42424242");
    write(dir.path(), "game/audio.rpa", &audio);
    write(dir.path(), "game/notes.txt", b"not an archive");

    let report = pipeline::run(dir.path(), &Options::default()).unwrap();
    let out = dir.path().join("rpakit_out");

    assert_eq!((report.found, report.done, report.skipped, report.failed), (2, 2, 0, 0));
    assert_eq!(report.files, 4);
    assert_eq!(report.destination.as_deref(), Some(out.as_path()));
    assert_eq!(fs::read(out.join("images/bg.png")).unwrap(), b"png-bytes");
    assert_eq!(fs::read(out.join("images/logo.png")).unwrap(), b"\x89PNG-rest");
    assert_eq!(fs::read(out.join("audio/theme.ogg")).unwrap(), b"OggS");
    assert!(!dir.path().join("escape.txt").exists());

    let images_report = report.depots.iter().find(|d| d.path.ends_with("images.rpa")).unwrap();
    assert_eq!(images_report.renamed, 1);
    let bad = fs::read_dir(&out)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().map_or(false, |x| x == "rpakit-bad"))
        .count();
    assert_eq!(bad, 1);

    // The output now exists and is not empty, so a second run refuses.
    let err = pipeline::run(dir.path(), &Options::default()).unwrap_err();
    assert!(matches!(err, RunError::DestinationNotEmpty(p) if p == out));
}

#[test]
fn test_unsupported_and_corrupt_depots_do_not_stop_the_run() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a_zix.rpa", b"ZiX-12A 0000000000000100 deadbeef\n\x00\x00");
    let mut corrupt = b"RPA-3.0 0000000000000022 42424242\n".to_vec();
    corrupt.extend_from_slice(b"not zlib at all");
    write(dir.path(), "b_corrupt.rpa", &corrupt);
    write(dir.path(), "c_plain.rpc", b"just some text\n");
    let good = Builder::new(0xFF).file("ok.txt", b"ok").rpa3("000000ff");
    write(dir.path(), "d_good.rpa", &good);

    let out = TempDir::new().unwrap();
    let dest = out.path().join("out");
    let report = pipeline::run(dir.path(), &options(Task::Extract, &dest)).unwrap();

    assert_eq!((report.found, report.done, report.skipped, report.failed), (4, 1, 2, 1));
    let lifecycles: Vec<_> = report.depots.iter().map(|d| d.lifecycle).collect();
    assert_eq!(
        lifecycles,
        vec![
            DepotLifecycle::Skipped,
            DepotLifecycle::Failed,
            DepotLifecycle::Skipped,
            DepotLifecycle::Extracted,
        ]
    );
    assert_eq!(report.depots[0].format, Some(FormatId::Zix12a));
    assert_eq!(report.depots[0].entries, 0);
    assert!(report.depots[1].message.as_deref().unwrap().contains("zlib"));
    assert_eq!(fs::read(dest.join("ok.txt")).unwrap(), b"ok");
}

#[test]
fn test_unreadable_entry_is_kept_under_placeholder() {
    let dir = TempDir::new().unwrap();
    let archive = Builder::new(0xFF)
        .file("fine.txt", b"fine")
        .raw("gone.txt", vec![Value::Tuple(vec![Value::I64(0xFFFF ^ 0xFF), Value::I64(10 ^ 0xFF)])])
        .rpa3("000000ff");
    write(dir.path(), "partial.rpa", &archive);

    let out = TempDir::new().unwrap();
    let dest = out.path().join("out");
    let report = pipeline::run(&dir.path().join("partial.rpa"), &options(Task::Extract, &dest)).unwrap();

    let depot = &report.depots[0];
    assert_eq!(depot.lifecycle, DepotLifecycle::Extracted);
    assert_eq!(
        (depot.written, depot.renamed, depot.truncated, depot.failed_entries),
        (2, 1, 1, 0)
    );
    assert_eq!(report.files, 2);
    assert_eq!(fs::read(dest.join("fine.txt")).unwrap(), b"fine");
    assert!(!dest.join("gone.txt").exists());

    let bad: Vec<_> = fs::read_dir(&dest)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|x| x == "rpakit-bad"))
        .collect();
    assert_eq!(bad.len(), 1);
    assert!(fs::read(&bad[0]).unwrap().is_empty());
}

#[test]
fn test_two_magics_split_by_binary_bytes_are_skipped() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "mixed.rpa", b"RPA-3.0 \xFF\xC3RPA-2.0 0000000000000022\n");
    let report = pipeline::run(dir.path(), &options(Task::Test, &dir.path().join("out"))).unwrap();

    let depot = &report.depots[0];
    assert_eq!(depot.lifecycle, DepotLifecycle::Skipped);
    assert_eq!(depot.format, None);
    assert!(depot.message.as_deref().unwrap().contains("several dialects"));
    assert_eq!(report.skipped, 1);
}

#[test]
fn test_simulate_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let archive = Builder::new(0xFF).file("a.txt", b"a").file("b.txt", b"b").rpa3("000000ff");
    write(dir.path(), "sim.rpa", &archive);

    let dest = dir.path().join("out");
    let report = pipeline::run(dir.path(), &options(Task::Simulate, &dest)).unwrap();

    assert_eq!(report.files, 2);
    assert_eq!(report.destination, None);
    assert!(!dest.exists());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn test_list_is_sorted_and_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let archive = Builder::new(0xFF)
        .file("z.txt", b"z")
        .file("a/b.txt", b"b")
        .file("m.txt", b"m")
        .rpa3("000000ff");
    write(dir.path(), "list.rpa", &archive);

    let dest = dir.path().join("out");
    let report = pipeline::run(dir.path(), &options(Task::List, &dest)).unwrap();

    assert_eq!(report.depots[0].lifecycle, DepotLifecycle::Listed);
    assert_eq!(report.depots[0].listing, vec!["a/b.txt", "m.txt", "z.txt"]);
    assert_eq!(report.files, 0);
    assert!(!dest.exists());
}

#[test]
fn test_json_report() {
    let dir = TempDir::new().unwrap();
    let archive = Builder::new(0xFF).file("a.txt", b"a").rpa3("000000ff");
    write(dir.path(), "j.rpa", &archive);

    let report = pipeline::run(dir.path(), &options(Task::Test, &dir.path().join("out"))).unwrap();
    let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&report).unwrap()).unwrap();

    assert_eq!(json["task"], "test");
    assert_eq!(json["depots"][0]["format"], "rpa3");
    assert_eq!(json["depots"][0]["lifecycle"], "tested");
    assert_eq!(json["depots"][0]["entries"], 1);
}
