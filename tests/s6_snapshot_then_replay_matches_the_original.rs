//! Scenario S6: snapshot a graph at metaversion V, apply a long sequence of
//! CRUD operations producing changelog entries V+1..V+N, then replay those
//! entries on a fresh graph restored from the snapshot. The replayed
//! graph's running checksum must land on the same value as the original.
//!
//! The operation sequence is driven by a small xorshift generator (no
//! external RNG dependency) seeded with a fixed constant, so the run is
//! deterministic across builds while still touching a wide mix of ops.

use lizardfs_core::metadata::changelog::parse_line;
use lizardfs_core::metadata::inode::{InodeId, Mode};
use lizardfs_core::metadata::locks::LockTable;
use lizardfs_core::metadata::session::SessionTable;
use lizardfs_core::metadata::snapshot::Snapshot;
use lizardfs_core::metadata::MetadataGraph;

struct Xorshift(u64);

impl Xorshift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn mode() -> Mode {
    Mode::from_bits_truncate(0o750)
}

const OP_COUNT: usize = 1000;

#[test]
fn shadow_replay_reproduces_the_masters_running_checksum() {
    let base_now = 1_700_000_000i64;
    let mut graph = MetadataGraph::new(base_now);

    // Seed a handful of directories and files so early operations have
    // something to act on.
    let mut dirs = vec![InodeId::ROOT];
    let mut files: Vec<InodeId> = Vec::new();
    for i in 0..5 {
        let d = graph.mkdir(InodeId::ROOT, format!("dir{}", i).as_bytes(), mode(), 0, 0, base_now).unwrap();
        dirs.push(d);
    }

    let snapshot = Snapshot::capture(&graph, &LockTable::default(), &SessionTable::default());
    let v_at_snapshot = graph.metaversion;
    graph.changelog.clear();

    let mut rng = Xorshift(0x9e3779b97f4a7c15);
    for i in 0..OP_COUNT {
        let now = base_now + i as i64 + 1;
        let parent = dirs[rng.below(dirs.len())];
        match rng.below(7) {
            0 => {
                let name = format!("f{}", i);
                if let Ok(id) = graph.create(parent, name.as_bytes(), mode(), 0, 0, now) {
                    files.push(id);
                }
            }
            1 => {
                let name = format!("d{}", i);
                if let Ok(id) = graph.mkdir(parent, name.as_bytes(), mode(), 0, 0, now) {
                    dirs.push(id);
                }
            }
            2 if !files.is_empty() => {
                let f = files[rng.below(files.len())];
                let _ = graph.write_chunk(f, rng.below(4), 0, 0, now);
            }
            3 if !files.is_empty() => {
                let f = files[rng.below(files.len())];
                let _ = graph.truncate(f, (rng.below(8) as u64) * lizardfs_core::chunk::part::CHUNK_SIZE, 0, 0, now);
            }
            4 if !files.is_empty() => {
                let f = files[rng.below(files.len())];
                let _ = graph.set_xattr(f, b"user.tag".to_vec(), format!("v{}", i).into_bytes(), now);
            }
            5 if !files.is_empty() => {
                let f = files[rng.below(files.len())];
                let _ = graph.set_goal(f, (rng.below(3) as u8) + 1, now);
            }
            6 => {
                // Most of these fail with ENOTEMPTY once children pile up;
                // that still exercises the failure path, and the handful
                // that succeed while empty exercise the success path.
                let victim = rng.below(5);
                let _ = graph.rmdir(InodeId::ROOT, format!("dir{}", victim).as_bytes(), now);
            }
            _ => {}
        }
    }

    assert!(graph.metaversion > v_at_snapshot, "the op mix must have produced at least one committed record");

    let records: Vec<_> = graph.changelog.pending_lines().iter().map(|line| parse_line(line).expect("every appended line must parse")).collect();

    let (mut shadow, _locks, _sessions) = snapshot.restore();
    assert_eq!(shadow.metaversion, v_at_snapshot);
    for rec in &records {
        shadow.replay_record(rec).expect("replay must not hit an unknown op");
    }

    assert_eq!(shadow.metaversion, graph.metaversion);
    assert_eq!(shadow.running_checksum(), graph.running_checksum());
}
