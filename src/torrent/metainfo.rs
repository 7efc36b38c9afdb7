use super::{FileDetail, PieceHashes};
use crate::bencode::{decode, dict_spans, BencodeValue};
use crate::error::{BittorrentError, Result};
use sha1::{Digest, Sha1};

/// A file entry as listed in the info dictionary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: Vec<String>,
    pub length: u64,
}

/// The info dictionary of a .torrent file
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u64,
    pub pieces: PieceHashes,
    pub files: Vec<FileInfo>,
    /// Single-file torrents store their payload directly under `name`
    pub multi_file: bool,
    pub total_length: u64,
}

impl TorrentInfo {
    fn from_bencode(value: &BencodeValue) -> Result<Self> {
        let name = value
            .get(b"name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("missing 'name'"))?
            .to_string();
        check_component(&name)?;

        let piece_length = value
            .get(b"piece length")
            .and_then(|v| v.as_integer())
            .filter(|&len| len > 0)
            .ok_or_else(|| invalid("missing or non-positive 'piece length'"))?
            as u64;

        let pieces = value
            .get(b"pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| invalid("missing 'pieces'"))
            .and_then(PieceHashes::from_bytes)?;

        let (files, multi_file) = match (value.get(b"length"), value.get(b"files")) {
            (Some(length), None) => {
                let length = non_negative(length, "length")?;
                (
                    vec![FileInfo {
                        path: vec![name.clone()],
                        length,
                    }],
                    false,
                )
            }
            (None, Some(files)) => {
                let list = files
                    .as_list()
                    .filter(|l| !l.is_empty())
                    .ok_or_else(|| invalid("'files' must be a non-empty list"))?;
                let files = list.iter().map(parse_file).collect::<Result<Vec<_>>>()?;
                (files, true)
            }
            _ => return Err(invalid("exactly one of 'length' or 'files' is required")),
        };

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total_length.div_ceil(piece_length);
        if expected_pieces != pieces.len() as u64 {
            return Err(invalid(format!(
                "{} piece hashes for {} bytes at piece length {}",
                pieces.len(),
                total_length,
                piece_length
            )));
        }

        Ok(Self {
            name,
            piece_length,
            pieces,
            files,
            multi_file,
            total_length,
        })
    }

    /// Lay the files out end to end over the torrent payload.
    ///
    /// Multi-file torrents are rooted in a directory named after the torrent.
    pub fn file_details(&self) -> Vec<FileDetail> {
        let mut begin = 0u64;
        self.files
            .iter()
            .map(|file| {
                let path = if self.multi_file {
                    std::iter::once(self.name.clone())
                        .chain(file.path.iter().cloned())
                        .collect()
                } else {
                    file.path.clone()
                };
                let detail = FileDetail::new(path, begin, begin + file.length);
                begin += file.length;
                detail
            })
            .collect()
    }
}

/// A parsed .torrent file
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub announce: Option<String>,
    pub info: TorrentInfo,
    /// SHA-1 of the raw bencoded info dictionary
    pub info_hash: [u8; 20],
}

impl Metainfo {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let root = decode(data)?;
        if root.as_dict().is_none() {
            return Err(invalid("torrent must be a dictionary"));
        }

        let info_span = dict_spans(data)?
            .into_iter()
            .find(|(key, _)| key == b"info")
            .map(|(_, span)| span)
            .ok_or_else(|| invalid("missing 'info'"))?;

        let info_value = root.get(b"info").ok_or_else(|| invalid("missing 'info'"))?;
        let info = TorrentInfo::from_bencode(info_value)?;

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&Sha1::digest(&data[info_span]));

        Ok(Self {
            announce: root.get(b"announce").and_then(|v| v.as_str()).map(String::from),
            info,
            info_hash,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn parse_file(value: &BencodeValue) -> Result<FileInfo> {
    let length = value
        .get(b"length")
        .ok_or_else(|| invalid("file entry missing 'length'"))
        .and_then(|v| non_negative(v, "length"))?;

    let path = value
        .get(b"path")
        .and_then(|v| v.as_list())
        .filter(|l| !l.is_empty())
        .ok_or_else(|| invalid("file entry missing 'path'"))?
        .iter()
        .map(|component| {
            let component = component
                .as_str()
                .ok_or_else(|| invalid("path component is not UTF-8"))?;
            check_component(component)?;
            Ok(component.to_string())
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(FileInfo { path, length })
}

fn non_negative(value: &BencodeValue, field: &str) -> Result<u64> {
    value
        .as_integer()
        .filter(|&n| n >= 0)
        .map(|n| n as u64)
        .ok_or_else(|| invalid(format!("'{}' must be a non-negative integer", field)))
}

/// Path components come from the network and must not escape the download root
fn check_component(component: &str) -> Result<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\'])
    {
        return Err(invalid(format!("unsafe path component {:?}", component)));
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> BittorrentError {
    BittorrentError::InvalidTorrent(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let mut data = b"d8:announce15:http://tracker/4:infod6:lengthi40000e4:name8:file.bin12:piece lengthi32768e6:pieces40:".to_vec();
        data.extend_from_slice(&[0xAA; 40]);
        data.extend_from_slice(b"ee");
        data
    }

    fn multi_file_torrent() -> Vec<u8> {
        let mut data = b"d4:infod5:filesld6:lengthi10e4:pathl1:aeed6:lengthi20e4:pathl3:sub1:beee4:name3:dir12:piece lengthi16e6:pieces40:".to_vec();
        data.extend_from_slice(&[0x11; 40]);
        data.extend_from_slice(b"ee");
        data
    }

    #[test]
    fn test_single_file_metainfo() {
        let data = single_file_torrent();
        let meta = Metainfo::from_bytes(&data).unwrap();

        assert_eq!(meta.announce.as_deref(), Some("http://tracker/"));
        assert_eq!(meta.info.name, "file.bin");
        assert_eq!(meta.info.total_length, 40000);
        assert_eq!(meta.info.pieces.len(), 2);
        assert!(!meta.info.multi_file);

        let details = meta.info.file_details();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].path, vec!["file.bin".to_string()]);
        assert_eq!((details[0].begin, details[0].end), (0, 40000));
    }

    #[test]
    fn test_info_hash_covers_raw_info_dict() {
        let data = single_file_torrent();
        let meta = Metainfo::from_bytes(&data).unwrap();

        let start = data.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let raw_info = &data[start..data.len() - 1];
        let expected: [u8; 20] = Sha1::digest(raw_info).into();
        assert_eq!(meta.info_hash, expected);
    }

    #[test]
    fn test_multi_file_details_are_contiguous() {
        let meta = Metainfo::from_bytes(&multi_file_torrent()).unwrap();
        let details = meta.info.file_details();

        assert_eq!(details.len(), 2);
        assert_eq!(details[0].path, vec!["dir", "a"]);
        assert_eq!((details[0].begin, details[0].end), (0, 10));
        assert_eq!(details[1].path, vec!["dir", "sub", "b"]);
        assert_eq!((details[1].begin, details[1].end), (10, 30));
    }

    #[test]
    fn test_rejects_path_traversal() {
        let mut data = b"d4:infod5:filesld6:lengthi10e4:pathl2:..1:aeee4:name3:dir12:piece lengthi16e6:pieces20:".to_vec();
        data.extend_from_slice(&[0x11; 20]);
        data.extend_from_slice(b"ee");

        assert!(matches!(
            Metainfo::from_bytes(&data),
            Err(BittorrentError::InvalidTorrent(_))
        ));
    }

    #[test]
    fn test_rejects_piece_count_mismatch() {
        let mut data = b"d4:infod6:lengthi40000e4:name1:f12:piece lengthi32768e6:pieces20:".to_vec();
        data.extend_from_slice(&[0; 20]);
        data.extend_from_slice(b"ee");

        assert!(Metainfo::from_bytes(&data).is_err());
    }
}
