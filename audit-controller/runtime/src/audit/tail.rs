use std::{
    fs::Metadata,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncSeekExt, BufReader},
};

/// Reads complete lines appended to a file.
#[derive(Debug)]
pub(super) struct Tail {
    path: PathBuf,
    reader: BufReader<File>,
    id: Option<FileId>,
    offset: u64,
    partial: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum Position {
    Start,
    End,
    /// A byte offset recorded from an earlier [`Tail`] on the same file.
    At(u64),
}

/// How the file at the tailed path relates to the open handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum Change {
    Unchanged,
    /// The path now names a different file.
    Replaced,
    /// The file is shorter than what has already been read.
    Truncated,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(super) struct FileId {
    dev: u64,
    ino: u64,
}

// === impl Tail ===

impl Tail {
    pub(super) async fn open(path: &Path, from: Position) -> io::Result<Self> {
        let mut file = File::open(path).await?;
        let meta = file.metadata().await?;
        let offset = match from {
            Position::Start => 0,
            Position::End => meta.len(),
            Position::At(offset) => offset.min(meta.len()),
        };
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            id: FileId::of(&meta),
            offset,
            partial: Vec::new(),
        })
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    pub(super) fn id(&self) -> Option<FileId> {
        self.id
    }

    /// The offset just past the last complete line returned.
    pub(super) fn resume_offset(&self) -> u64 {
        self.offset - self.partial.len() as u64
    }

    /// Returns the lines completed since the last read. A trailing line
    /// without a newline is held until it is completed.
    pub(super) async fn read_lines(&mut self) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let n = self.reader.read_until(b'\n', &mut self.partial).await?;
            if n == 0 {
                return Ok(lines);
            }
            self.offset += n as u64;
            if self.partial.last() != Some(&b'\n') {
                return Ok(lines);
            }
            let line = String::from_utf8_lossy(&self.partial).trim_end().to_string();
            self.partial.clear();
            lines.push(line);
        }
    }

    /// Compares the open handle against whatever the path names now.
    pub(super) async fn check(&self) -> io::Result<Change> {
        let meta = tokio::fs::metadata(&self.path).await?;
        if FileId::of(&meta) != self.id {
            return Ok(Change::Replaced);
        }
        if meta.len() < self.offset {
            return Ok(Change::Truncated);
        }
        Ok(Change::Unchanged)
    }
}

// === impl FileId ===

impl FileId {
    #[cfg(unix)]
    pub(super) fn of(meta: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    pub(super) fn of(_: &Metadata) -> Option<Self> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn reads_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        append(&path, "old\n");

        let mut tail = Tail::open(&path, Position::End).await.unwrap();
        assert!(tail.read_lines().await.unwrap().is_empty());

        append(&path, "one\ntw");
        assert_eq!(tail.read_lines().await.unwrap(), ["one"]);
        append(&path, "o\nthree\n");
        assert_eq!(tail.read_lines().await.unwrap(), ["two", "three"]);
        assert_eq!(tail.check().await.unwrap(), Change::Unchanged);

        let mut from_start = Tail::open(&path, Position::Start).await.unwrap();
        assert_eq!(
            from_start.read_lines().await.unwrap(),
            ["old", "one", "two", "three"]
        );
    }

    #[tokio::test]
    async fn resumes_after_the_last_complete_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        append(&path, "one\ntw");

        let mut tail = Tail::open(&path, Position::Start).await.unwrap();
        assert_eq!(tail.read_lines().await.unwrap(), ["one"]);
        let offset = tail.resume_offset();
        assert_eq!(offset, 4);

        append(&path, "o\n");
        let mut resumed = Tail::open(&path, Position::At(offset)).await.unwrap();
        assert_eq!(resumed.id(), tail.id());
        assert_eq!(resumed.read_lines().await.unwrap(), ["two"]);
    }

    #[tokio::test]
    async fn detects_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        append(&path, "one\ntwo\n");
        let tail = Tail::open(&path, Position::End).await.unwrap();

        std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        assert_eq!(tail.check().await.unwrap(), Change::Truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detects_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        append(&path, "one\n");
        let mut tail = Tail::open(&path, Position::End).await.unwrap();

        std::fs::rename(&path, dir.path().join("audit.log.1")).unwrap();
        append(&path, "fresh\n");
        assert_eq!(tail.check().await.unwrap(), Change::Replaced);

        // The old handle still reads the rotated file.
        append(&dir.path().join("audit.log.1"), "late\n");
        assert_eq!(tail.read_lines().await.unwrap(), ["late"]);
    }
}
