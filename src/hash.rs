//! 文件哈希计算
//!
//! 下载完成后按配置的算法对临时文件做整体校验，结果统一为小写十六进制字符串。

use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::config::HashAlgorithm;

/// 读文件的缓冲大小
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// 哈希计算接口
pub trait HashProvider: Send + Sync {
    /// 计算整个文件的哈希，返回小写十六进制
    fn compute(&self, path: &Path, algorithm: HashAlgorithm) -> io::Result<String>;
}

/// 基于 md5 / sha1 / sha2 / crc32fast 的默认实现
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestHashProvider;

impl HashProvider for DigestHashProvider {
    fn compute(&self, path: &Path, algorithm: HashAlgorithm) -> io::Result<String> {
        let mut file = File::open(path)?;
        match algorithm {
            HashAlgorithm::Md5 => {
                let mut ctx = md5::Context::new();
                read_chunks(&mut file, |buf| ctx.consume(buf))?;
                Ok(format!("{:x}", ctx.compute()))
            }
            HashAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                read_chunks(&mut file, |buf| hasher.update(buf))?;
                Ok(hex::encode(hasher.finalize()))
            }
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                read_chunks(&mut file, |buf| hasher.update(buf))?;
                Ok(hex::encode(hasher.finalize()))
            }
            HashAlgorithm::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                read_chunks(&mut file, |buf| hasher.update(buf))?;
                Ok(format!("{:08x}", hasher.finalize()))
            }
        }
    }
}

fn read_chunks(file: &mut File, mut consume: impl FnMut(&[u8])) -> io::Result<()> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            return Ok(());
        }
        consume(&buffer[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_known_digests() {
        let file = file_with(b"hello world");
        let provider = DigestHashProvider;

        assert_eq!(
            provider.compute(file.path(), HashAlgorithm::Md5).unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(
            provider.compute(file.path(), HashAlgorithm::Sha1).unwrap(),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
        assert_eq!(
            provider.compute(file.path(), HashAlgorithm::Sha256).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            provider.compute(file.path(), HashAlgorithm::Crc32).unwrap(),
            "0d4a1185"
        );
    }

    #[test]
    fn test_empty_file() {
        let file = file_with(b"");
        assert_eq!(
            DigestHashProvider
                .compute(file.path(), HashAlgorithm::Md5)
                .unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = DigestHashProvider.compute(&dir.path().join("nope"), HashAlgorithm::Sha1);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }
}
