//! Torrent file parser
//!
//! Builds a [`TorrentMeta`] from a bencoded `.torrent` file.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use serde_bencode::value::Value;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::torrent::info::{TorrentFile, TorrentMeta};

type Dict = HashMap<Vec<u8>, Value>;

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentMeta> {
        info!("Parsing torrent metadata from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root: Value = serde_bencode::from_bytes(data).map_err(TorrentError::from)?;
        let root = match root {
            Value::Dict(d) => d,
            _ => return Err(TorrentError::parse_error("Root must be a dictionary").into()),
        };

        let info_value = root
            .get(b"info".as_ref())
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;

        // Bencode dictionaries serialize with sorted keys, so re-encoding the
        // parsed info dictionary reproduces the canonical bytes.
        let info_bytes = serde_bencode::to_bytes(info_value).map_err(TorrentError::from)?;
        let info_hash = TorrentMeta::generate_info_hash(&info_bytes);
        debug!("Info hash: {}", hex::encode(info_hash));

        let info_dict = match info_value {
            Value::Dict(d) => d,
            _ => return Err(TorrentError::parse_error("Info must be a dictionary").into()),
        };

        Self::convert_to_meta(info_dict, info_hash)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentMeta> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    fn convert_to_meta(info: &Dict, info_hash: [u8; 20]) -> Result<TorrentMeta> {
        let name = get_string(info, b"name")?;

        let piece_length = get_int(info, b"piece length")?;
        if piece_length <= 0 {
            return Err(TorrentError::parse_error_with_source("Invalid piece length", piece_length.to_string()).into());
        }

        let pieces_bytes = get_bytes(info, b"pieces")?;
        let pieces = TorrentMeta::parse_piece_hashes(pieces_bytes)?;

        let files = if info.contains_key(b"length".as_ref()) {
            let length = get_length(info)?;
            vec![TorrentFile::new(vec![name.clone()], length)]
        } else if let Some(Value::List(entries)) = info.get(b"files".as_ref()) {
            let mut files = Vec::with_capacity(entries.len());
            for entry in entries {
                let Value::Dict(file_dict) = entry else {
                    return Err(TorrentError::parse_error("File entry must be a dictionary").into());
                };
                let length = get_length(file_dict)?;
                let components = match file_dict.get(b"path".as_ref()) {
                    Some(Value::List(l)) => l,
                    _ => return Err(TorrentError::parse_error("Missing file path").into()),
                };

                // Multi-file torrents live under a directory named after the torrent
                let mut path = vec![name.clone()];
                for component in components {
                    match component {
                        Value::Bytes(b) => path.push(String::from_utf8_lossy(b).into_owned()),
                        _ => return Err(TorrentError::parse_error("Path component must be a string").into()),
                    }
                }
                files.push(TorrentFile::new(path, length));
            }
            files
        } else {
            return Err(TorrentError::parse_error("Neither length nor files found in info dict").into());
        };

        debug!("Parsed {} files, {} pieces of {} bytes", files.len(), pieces.len(), piece_length);
        let meta = TorrentMeta::new(name, info_hash, piece_length as u64, pieces, files)?;
        info!("Successfully parsed torrent: {} ({} bytes)", meta.name, meta.total_size());
        Ok(meta)
    }
}

fn get_bytes<'a>(dict: &'a Dict, key: &[u8]) -> Result<&'a [u8]> {
    match dict.get(key) {
        Some(Value::Bytes(b)) => Ok(b),
        _ => Err(TorrentError::parse_error(format!("Missing {} field", String::from_utf8_lossy(key))).into()),
    }
}

fn get_string(dict: &Dict, key: &[u8]) -> Result<String> {
    Ok(String::from_utf8_lossy(get_bytes(dict, key)?).into_owned())
}

fn get_int(dict: &Dict, key: &[u8]) -> Result<i64> {
    match dict.get(key) {
        Some(Value::Int(i)) => Ok(*i),
        _ => Err(TorrentError::parse_error(format!("Missing {} field", String::from_utf8_lossy(key))).into()),
    }
}

fn get_length(dict: &Dict) -> Result<u64> {
    let length = get_int(dict, b"length")?;
    u64::try_from(length)
        .map_err(|_| TorrentError::parse_error_with_source("Negative file length", length.to_string()).into())
}
