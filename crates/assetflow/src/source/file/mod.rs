mod reader;

pub use reader::FileReadStream;

use crate::{
    AssetQueue,
    source::{DelegateRef, StreamSource, StreamState},
};
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// A [`StreamSource`] over a local file.
///
/// Thin adapter around [`FileReadStream`]: the queue and delegate are bound at
/// construction and every operation is forwarded. Closing unbinds them in the
/// reverse order before releasing the file.
pub struct FileStreamSource {
    path: PathBuf,
    reader: FileReadStream,
}

impl FileStreamSource {
    pub fn new(
        path: impl Into<PathBuf>,
        queue: AssetQueue,
        delegate: DelegateRef,
        read_block_size: usize,
    ) -> Self {
        let path = path.into();
        let reader = FileReadStream::new(&path, read_block_size);
        reader.set_delegate(Some(delegate));
        reader.schedule(Some(queue));
        Self { path, reader }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StreamSource for FileStreamSource {
    fn open(&self) {
        self.reader.open();
    }

    fn read(&self, max_len: usize) -> Bytes {
        self.reader.read(max_len)
    }

    fn has_available(&self) -> bool {
        self.reader.has_available()
    }

    fn peek(&self) -> Option<Bytes> {
        self.reader.peek()
    }

    fn close(&self) {
        self.reader.schedule(None);
        self.reader.set_delegate(None);
        self.reader.close();
    }

    fn state(&self) -> StreamState {
        self.reader.status()
    }
}

impl Drop for FileStreamSource {
    fn drop(&mut self) {
        self.close();
    }
}
