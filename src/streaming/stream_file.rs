//! Read-only access to a dataset's primitive stream file
//!
//! The file is a flat array of nodes, each `node_byte_size` bytes,
//! addressed by `node_id * node_byte_size`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::core::types::NodeId;

/// An open primitive stream. Each loader thread owns its own handle.
#[derive(Debug)]
pub struct PrimitiveStream {
    file: File,
    path: PathBuf,
    node_byte_size: usize,
    node_count: u32,
}

impl PrimitiveStream {
    pub fn open(path: &Path, node_byte_size: usize, node_count: u32) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            node_byte_size,
            node_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn node_byte_size(&self) -> usize {
        self.node_byte_size
    }

    /// Byte offset of `node` in the stream
    pub fn offset_of(&self, node: NodeId) -> u64 {
        node as u64 * self.node_byte_size as u64
    }

    /// Read one node into `buf`, which must be exactly one node long.
    ///
    /// A file that ends early yields `UnexpectedEof`.
    pub fn read_node(&mut self, node: NodeId, buf: &mut [u8]) -> io::Result<()> {
        if node >= self.node_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("node {} outside stream of {} nodes", node, self.node_count),
            ));
        }
        if buf.len() != self.node_byte_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer of {} bytes for {} byte nodes", buf.len(), self.node_byte_size),
            ));
        }
        self.file.seek(SeekFrom::Start(self.offset_of(node)))?;
        self.file.read_exact(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::testing;

    #[test]
    fn test_read_node_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = testing::write_fixture(dir.path(), "s", 4, 2, 4, 4);
        let node_bytes = fixture.hierarchy.node_byte_size();

        let mut stream = PrimitiveStream::open(&fixture.stream_path, node_bytes, 21).unwrap();
        let mut buf = vec![0u8; node_bytes];
        stream.read_node(17, &mut buf).unwrap();
        assert_eq!(buf, testing::node_pattern(17, node_bytes));
        assert_eq!(stream.offset_of(17), 17 * 16);
    }

    #[test]
    fn test_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.lod");
        std::fs::write(&path, vec![1u8; 40]).unwrap();

        let mut stream = PrimitiveStream::open(&path, 16, 4).unwrap();
        let mut buf = vec![0u8; 16];
        assert!(stream.read_node(1, &mut buf).is_ok());
        let err = stream.read_node(2, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_out_of_range_node() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.lod");
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let mut stream = PrimitiveStream::open(&path, 16, 4).unwrap();
        let mut buf = vec![0u8; 16];
        let err = stream.read_node(4, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
