//! Line-oriented debug dumps.
//!
//! Plain-text exports of the resident graph and dictionary, one record per
//! line, for offline inspection and diffing:
//!
//! | file                    | format                                            |
//! |-------------------------|---------------------------------------------------|
//! | `DumpMemorySign.txt`    | `signatureId wordId1 wordId2 …`                   |
//! | `DumpMemorySign3.txt`   | same, words with finite non-zero 3-D only         |
//! | `DumpMemoryTree.txt`    | `id weight nLoop loopIds… nChild childIds…`       |
//! | `DumpMemoryWordRef.txt` | `wordId sigId1 sigId2 …` (one per citation)       |
//! | `DumpMemoryWordDesc.txt`| `wordId v1 v2 …`                                  |

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::memory::Memory;

impl Memory {
    /// Write every dump file into `directory`.
    pub fn dump_memory(&self, directory: &Path) -> io::Result<()> {
        info!(directory = %directory.display(), "dumping memory");
        self.dump_dictionary(
            &directory.join("DumpMemoryWordRef.txt"),
            &directory.join("DumpMemoryWordDesc.txt"),
        )?;
        self.dump_signatures(&directory.join("DumpMemorySign.txt"), false)?;
        self.dump_signatures(&directory.join("DumpMemorySign3.txt"), true)?;
        self.dump_memory_tree(&directory.join("DumpMemoryTree.txt"))
    }

    /// One line per resident signature: its id followed by its word ids
    /// (repeated per citation).  With `words3_only`, words are restricted to
    /// those carrying a finite, non-zero 3-D point.
    pub fn dump_signatures(&self, path: &Path, words3_only: bool) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "SignatureID WordsID...")?;
        let mut ids: Vec<i32> = self.signatures.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let signature = &self.signatures[&id];
            write!(out, "{id}")?;
            if words3_only {
                for (word, points) in signature.words3() {
                    for point in points {
                        if point.is_finite() && (point.x != 0.0 || point.y != 0.0 || point.z != 0.0)
                        {
                            write!(out, " {word}")?;
                        }
                    }
                }
            } else {
                for (word, keypoints) in signature.words() {
                    for _ in keypoints {
                        write!(out, " {word}")?;
                    }
                }
            }
            writeln!(out)?;
        }
        out.flush()
    }

    /// One line per resident signature: id, weight, then its loop closures
    /// (peer id above its own) and children (peer id below), neighbour links
    /// excluded.
    pub fn dump_memory_tree(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(
            out,
            "SignatureID Weight NbLoopClosureIds LoopClosureIds... \
             NbChildLoopClosureIds ChildLoopClosureIds..."
        )?;
        let mut ids: Vec<i32> = self.signatures.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let signature = &self.signatures[&id];
            let mut loops = Vec::new();
            let mut children = Vec::new();
            for (&peer, link) in signature.links() {
                if link.kind.is_neighbor() {
                    continue;
                }
                if peer < id {
                    children.push(peer);
                } else {
                    loops.push(peer);
                }
            }
            write!(out, "{id} {}", signature.weight())?;
            write!(out, " {}", loops.len())?;
            for peer in loops {
                write!(out, " {peer}")?;
            }
            write!(out, " {}", children.len())?;
            for peer in children {
                write!(out, " {peer}")?;
            }
            writeln!(out)?;
        }
        out.flush()
    }

    /// Export the dictionary: the inverted index to `ref_path`, descriptors
    /// to `desc_path`.
    pub fn dump_dictionary(&self, ref_path: &Path, desc_path: &Path) -> io::Result<()> {
        let mut refs = BufWriter::new(File::create(ref_path)?);
        let mut descs = BufWriter::new(File::create(desc_path)?);
        writeln!(refs, "WordID SignatureIds...")?;
        writeln!(descs, "WordID Descriptor...")?;
        for word in self.dictionary().words() {
            write!(refs, "{}", word.id())?;
            for (&signature, &count) in word.references() {
                for _ in 0..count {
                    write!(refs, " {signature}")?;
                }
            }
            writeln!(refs)?;

            write!(descs, "{}", word.id())?;
            for value in word.descriptor() {
                write!(descs, " {value}")?;
            }
            writeln!(descs)?;
        }
        refs.flush()?;
        descs.flush()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::testutil::{make_memory, observation, translate};
    use rovermap_core::{Link, LinkKind};

    #[test]
    fn dump_files_are_written_with_headers() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut memory = make_memory(|c| c.map_labels_added = false);
        for i in 0..3 {
            memory
                .update(observation(i), Some(translate(i as f32)), None, None)
                .unwrap();
        }
        memory.add_link(Link::new(3, 1, LinkKind::GlobalClosure, Some(translate(0.1))));

        memory.dump_memory(dir.path()).expect("dump");

        let sign = std::fs::read_to_string(dir.path().join("DumpMemorySign.txt")).unwrap();
        let mut lines = sign.lines();
        assert_eq!(lines.next(), Some("SignatureID WordsID..."));
        assert_eq!(lines.count(), 3, "one line per signature");

        let tree = std::fs::read_to_string(dir.path().join("DumpMemoryTree.txt")).unwrap();
        // Node 1 has one loop closure (3) and no children.
        let node1 = tree.lines().nth(1).unwrap();
        assert_eq!(node1, "1 0 1 3 0");
        // Node 3 has one child (1) and no loops.
        let node3 = tree.lines().nth(3).unwrap();
        assert_eq!(node3, "3 0 0 1 1");

        let word_ref = std::fs::read_to_string(dir.path().join("DumpMemoryWordRef.txt")).unwrap();
        assert!(word_ref.starts_with("WordID SignatureIds..."));
        assert!(word_ref.lines().count() > 1);

        let word_desc =
            std::fs::read_to_string(dir.path().join("DumpMemoryWordDesc.txt")).unwrap();
        assert!(word_desc.starts_with("WordID Descriptor..."));
    }

    #[test]
    fn sign3_dump_skips_unknown_points() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut memory = make_memory(|_| {});
        memory.update(observation(1), None, None, None).unwrap();

        memory
            .dump_signatures(&dir.path().join("DumpMemorySign3.txt"), true)
            .expect("dump");
        let sign3 = std::fs::read_to_string(dir.path().join("DumpMemorySign3.txt")).unwrap();
        // No 3-D words at all: just the signature id on its line.
        assert_eq!(sign3.lines().nth(1), Some("1"));
    }
}
