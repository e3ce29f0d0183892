//! 위치 지정 블록 읽기/쓰기
//!
//! 블록마다 바이트 범위가 겹치지 않으므로 seek 없이 오프셋으로 직접 접근한다.

use std::fs::File;
use std::io;

/// `offset`에서 정확히 `len` 바이트 읽기
pub fn read_block(file: &File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_exact_at(file, &mut buf, offset)?;
    Ok(buf)
}

/// `offset`에 `data` 전체 쓰기 (파일 끝 너머도 가능)
pub fn write_block(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    write_all_at(file, data, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        match file.seek_write(data, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                data = &data[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_writes() {
        let file = tempfile::tempfile().unwrap();

        write_block(&file, 8, b"world").unwrap();
        write_block(&file, 0, b"hello, ").unwrap();
        write_block(&file, 7, b"!").unwrap();

        assert_eq!(read_block(&file, 0, 13).unwrap(), b"hello, !world");
        assert!(read_block(&file, 10, 10).is_err());
    }
}
