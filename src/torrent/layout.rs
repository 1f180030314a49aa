//! Maps the flat piece/byte offset space onto on-disk file spans (spec.md
//! §4.1 "Piece <-> file mapping"), for both single- and multi-file torrents.

use std::path::PathBuf;

use torrentd_primitives::metadata::Metadata;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub path: PathBuf,
    pub file_offset: u64,
    pub length: u64,
}

/// File boundaries precomputed once per torrent so piece I/O never re-walks
/// the file list.
#[derive(Debug, Clone)]
pub struct FileLayout {
    starts: Vec<u64>,
    paths: Vec<PathBuf>,
    lengths: Vec<u64>,
}

impl FileLayout {
    #[must_use]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let mut starts = Vec::with_capacity(metadata.files.len());
        let mut paths = Vec::with_capacity(metadata.files.len());
        let mut lengths = Vec::with_capacity(metadata.files.len());
        let mut offset = 0u64;
        for file in &metadata.files {
            starts.push(offset);
            paths.push(file.path.iter().collect());
            lengths.push(file.length);
            offset += file.length;
        }
        Self { starts, paths, lengths }
    }

    /// Splits `[offset, offset+length)` of the concatenated byte space into
    /// the per-file spans it touches, in file order.
    #[must_use]
    pub fn spans(&self, offset: u64, length: u64) -> Vec<FileSpan> {
        let end = offset + length;
        let mut out = Vec::new();
        for i in 0..self.starts.len() {
            let file_start = self.starts[i];
            let file_end = file_start + self.lengths[i];
            let span_start = offset.max(file_start);
            let span_end = end.min(file_end);
            if span_start < span_end {
                out.push(FileSpan { path: self.paths[i].clone(), file_offset: span_start - file_start, length: span_end - span_start });
            }
        }
        out
    }

    /// Byte offset of piece `index`'s first byte in the concatenated space.
    #[must_use]
    pub fn piece_offset(piece_length: u32, index: u32) -> u64 {
        u64::from(piece_length) * u64::from(index)
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.paths.len()
    }

    /// Inclusive range of piece indices `file_index` overlaps, given
    /// `piece_length` (spec.md §4.1 `setFilePriority`: a piece spanning a
    /// skipped and a wanted file is still downloaded, so this is used to
    /// mark a piece "wanted" the moment any overlapping file is wanted,
    /// never to exclude a piece outright for touching a skipped file).
    #[must_use]
    pub fn file_piece_range(&self, file_index: usize, piece_length: u32) -> Option<(u32, u32)> {
        let file_start = *self.starts.get(file_index)?;
        let length = *self.lengths.get(file_index)?;
        if length == 0 {
            return None;
        }
        let file_end = file_start + length - 1;
        let piece_length = u64::from(piece_length);
        #[allow(clippy::cast_possible_truncation)]
        let first = (file_start / piece_length) as u32;
        #[allow(clippy::cast_possible_truncation)]
        let last = (file_end / piece_length) as u32;
        Some((first, last))
    }
}

#[cfg(test)]
mod tests {
    use torrentd_primitives::metadata::FileEntry;

    use super::*;

    fn metadata_with_files(files: Vec<(&str, u64)>) -> Metadata {
        Metadata {
            info_hash: torrentd_primitives::info_hash::InfoHash::from([0u8; 20]),
            name: "t".to_owned(),
            piece_length: 16384,
            total_length: files.iter().map(|f| f.1).sum(),
            files: files.into_iter().map(|(p, l)| FileEntry { path: vec![p.to_owned()], length: l }).collect(),
            piece_hashes: vec![],
            raw_info: vec![],
        }
    }

    #[test]
    fn should_split_a_span_crossing_two_files() {
        let metadata = metadata_with_files(vec![("a.txt", 10), ("b.txt", 20)]);
        let layout = FileLayout::from_metadata(&metadata);
        let spans = layout.spans(5, 10);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0], FileSpan { path: PathBuf::from("a.txt"), file_offset: 5, length: 5 });
        assert_eq!(spans[1], FileSpan { path: PathBuf::from("b.txt"), file_offset: 0, length: 5 });
    }

    #[test]
    fn should_return_one_span_fully_inside_one_file() {
        let metadata = metadata_with_files(vec![("a.txt", 100)]);
        let layout = FileLayout::from_metadata(&metadata);
        let spans = layout.spans(10, 20);
        assert_eq!(spans, vec![FileSpan { path: PathBuf::from("a.txt"), file_offset: 10, length: 20 }]);
    }

    #[test]
    fn should_compute_the_piece_range_a_file_overlaps() {
        let metadata = metadata_with_files(vec![("a.txt", 10), ("b.txt", 40)]);
        let layout = FileLayout::from_metadata(&metadata);
        assert_eq!(layout.file_piece_range(0, 16), Some((0, 0)));
        assert_eq!(layout.file_piece_range(1, 16), Some((0, 3)));
    }
}
