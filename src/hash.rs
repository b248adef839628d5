//! 双哈希计算
//!
//! 对同一字节流单趟计算两个 128 位摘要：全量哈希覆盖所有字节，
//! 前缀哈希只覆盖开头 100 KiB（流更短时等于全量哈希）。
//! 两个哈希共同构成去重判据：全量哈希是权威键，前缀哈希是廉价的否定过滤器。

use crate::error::Result;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// 前缀哈希覆盖的字节数（100 KiB）
pub const PREFIX_LIMIT: u64 = 102_400;

/// 流式读取的缓冲区大小
pub const BUF_SIZE: usize = 32 * 1024;

/// 单趟双哈希状态
///
/// 内存占用与输入长度无关：只有两个 MD5 上下文和一个计数器。
pub struct DualHasher {
    full: md5::Context,
    prefix: md5::Context,
    seen: u64,
}

impl DualHasher {
    pub fn new() -> Self {
        Self {
            full: md5::Context::new(),
            prefix: md5::Context::new(),
            seen: 0,
        }
    }

    /// 喂入一段数据
    ///
    /// 跨越 100 KiB 边界的缓冲区只把边界之前的部分喂给前缀哈希。
    pub fn update(&mut self, buf: &[u8]) {
        self.full.consume(buf);
        if self.seen < PREFIX_LIMIT {
            let remain = (PREFIX_LIMIT - self.seen) as usize;
            let take = remain.min(buf.len());
            self.prefix.consume(&buf[..take]);
        }
        self.seen += buf.len() as u64;
    }

    /// 已喂入的字节总数
    pub fn bytes_seen(&self) -> u64 {
        self.seen
    }

    /// 结束计算，返回 (全量哈希, 前缀哈希) 的小写十六进制
    pub fn finalize(self) -> (String, String) {
        let full = format!("{:x}", self.full.compute());
        let prefix = format!("{:x}", self.prefix.compute());
        (full, prefix)
    }
}

impl Default for DualHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// 计算内存中一段数据的全量哈希
pub fn checksum_bytes(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// 流式计算文件的 (全量哈希, 前缀哈希)
///
/// 单趟读取，缓冲区 32 KiB，适用于任意大小的文件。
pub async fn digest_file(path: &Path) -> Result<(String, String)> {
    let mut file = File::open(path).await?;
    let mut hasher = DualHasher::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// 与文件写入融合的双哈希器
///
/// 服务端上传路径用它把同一个字节流同时送进磁盘和两个哈希状态，
/// 避免落盘后再读一遍文件。
pub struct HashingFileWriter {
    file: File,
    hasher: DualHasher,
}

impl HashingFileWriter {
    pub fn new(file: File) -> Self {
        Self {
            file,
            hasher: DualHasher::new(),
        }
    }

    /// 写入一段数据并同步更新哈希状态
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        Ok(())
    }

    /// 刷盘并结束，返回 (写入字节数, 全量哈希, 前缀哈希)
    pub async fn finish(mut self) -> std::io::Result<(u64, String, String)> {
        self.file.flush().await?;
        let written = self.hasher.bytes_seen();
        let (full, prefix) = self.hasher.finalize();
        Ok((written, full, prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// 空输入的 MD5
    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    #[test]
    fn test_empty_input() {
        let hasher = DualHasher::new();
        let (full, prefix) = hasher.finalize();
        assert_eq!(full, EMPTY_MD5);
        assert_eq!(prefix, EMPTY_MD5);
    }

    #[test]
    fn test_short_input_prefix_equals_full() {
        let mut hasher = DualHasher::new();
        hasher.update(b"hello!!\n");
        let (full, prefix) = hasher.finalize();
        assert_eq!(full, prefix);
        assert_eq!(full, checksum_bytes(b"hello!!\n"));
    }

    #[test]
    fn test_exactly_100k_prefix_equals_full() {
        let data = vec![0xabu8; PREFIX_LIMIT as usize];
        let mut hasher = DualHasher::new();
        hasher.update(&data);
        let (full, prefix) = hasher.finalize();
        assert_eq!(full, prefix);
    }

    #[test]
    fn test_over_100k_prefix_differs() {
        let data = vec![0xabu8; PREFIX_LIMIT as usize + 1];
        let mut hasher = DualHasher::new();
        hasher.update(&data);
        let (full, prefix) = hasher.finalize();
        assert_ne!(full, prefix);
        // 前缀哈希等于前 100 KiB 单独计算的结果
        assert_eq!(prefix, checksum_bytes(&data[..PREFIX_LIMIT as usize]));
    }

    #[test]
    fn test_boundary_split_mid_buffer() {
        // 分块方式不同，结果必须一致
        let data: Vec<u8> = (0..PREFIX_LIMIT as usize + 5000)
            .map(|i| (i % 251) as u8)
            .collect();

        let mut whole = DualHasher::new();
        whole.update(&data);
        let (full_a, prefix_a) = whole.finalize();

        let mut chunked = DualHasher::new();
        for chunk in data.chunks(7777) {
            chunked.update(chunk);
        }
        let (full_b, prefix_b) = chunked.finalize();

        assert_eq!(full_a, full_b);
        assert_eq!(prefix_a, prefix_b);
    }

    #[tokio::test]
    async fn test_digest_file_deterministic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.bin");
        let data: Vec<u8> = (0..200_000).map(|i| (i % 13) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let (full1, prefix1) = digest_file(&path).await.unwrap();
        let (full2, prefix2) = digest_file(&path).await.unwrap();
        assert_eq!(full1, full2);
        assert_eq!(prefix1, prefix2);
        assert_eq!(full1, checksum_bytes(&data));
        assert_eq!(prefix1, checksum_bytes(&data[..PREFIX_LIMIT as usize]));
    }

    #[tokio::test]
    async fn test_digest_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.bin");
        tokio::fs::write(&path, b"").await.unwrap();

        let (full, prefix) = digest_file(&path).await.unwrap();
        assert_eq!(full, EMPTY_MD5);
        assert_eq!(prefix, EMPTY_MD5);
    }

    #[tokio::test]
    async fn test_hashing_file_writer_matches_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.bin");
        let data: Vec<u8> = (0..150_000).map(|i| (i % 7) as u8).collect();

        let file = File::create(&path).await.unwrap();
        let mut writer = HashingFileWriter::new(file);
        for chunk in data.chunks(BUF_SIZE) {
            writer.write_chunk(chunk).await.unwrap();
        }
        let (written, full, prefix) = writer.finish().await.unwrap();

        assert_eq!(written, data.len() as u64);
        let on_disk = tokio::fs::read(&path).await.unwrap();
        assert_eq!(on_disk, data);
        assert_eq!(full, checksum_bytes(&data));
        assert_eq!(prefix, checksum_bytes(&data[..PREFIX_LIMIT as usize]));
    }
}
