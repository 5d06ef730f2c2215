//! Утилиты: vcrc32, нулевые буферы, санитизация имён, правила out-каталога,
//! простейший glob.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// CRC-32 вариант формата ("vcrc32") — это CRC-32C (Castagnoli).
/// Подтверждено пиновыми векторами: 00 -> 0x527d5351, 00*4 -> 0x48674bc7,
/// "Hello, World!" -> 0x4d551068.
#[inline]
pub fn vcrc32(crc: u32, buf: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, buf)
}

pub fn is_all_zero(buf: &[u8]) -> bool {
    let mut chunks = buf.chunks_exact(8);
    for c in &mut chunks {
        if u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) != 0 {
            return false;
        }
    }
    chunks.remainder().iter().all(|&b| b == 0)
}

pub fn filter_unprintable(s: &str) -> String {
    s.chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { '.' })
        .collect()
}

/// Замена запрещённых символов, схлопывание повторных слэшей,
/// многоточие -> подчёркивания.
pub fn sanitize_fname(fname: &str) -> String {
    let bytes = fname.as_bytes();
    let mut out = String::with_capacity(fname.len());
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => {
                out.push('_');
                i += 1;
            }
            _ if (bytes[i] < 0x20) || (bytes[i] >= 127) => {
                out.push('_');
                i += 1;
            }
            '.' | '/' | '\\' => {
                let start = i;
                while i < bytes.len() && bytes[i] as char == c {
                    i += 1;
                }
                let count = i - start;
                if count >= 2 {
                    if c == '.' {
                        for _ in 0..count {
                            out.push('_');
                        }
                    } else {
                        out.push(c);
                    }
                } else {
                    out.push(c);
                }
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

fn strip_device_prefix(p: &Path) -> PathBuf {
    let s = p.to_string_lossy();
    if let Some(rest) = s.strip_prefix("\\\\.\\") {
        return PathBuf::from(rest);
    }
    if let Some(rest) = s.strip_prefix("/dev/") {
        return PathBuf::from(rest);
    }
    p.to_path_buf()
}

fn path_ends_with(p: &Path, suffix: &str) -> bool {
    p.to_string_lossy().ends_with(suffix)
}

/// Каталог для результатов:
/// - явный `out_dir`, если задан;
/// - вход уже в ".out" каталоге -> его же каталог;
/// - METADATA/.md/.bank/.slot -> каталог входного файла;
/// - иначе "<вход>.out".
/// Каталог создаётся.
pub fn get_out_dir(in_fname: &Path, out_dir: Option<&Path>) -> Result<PathBuf> {
    const EXTS: [&str; 3] = [".md", ".bank", ".slot"];

    let in_fname = strip_device_prefix(in_fname);

    let dir: PathBuf = if let Some(d) = out_dir {
        d.to_path_buf()
    } else if in_fname
        .parent()
        .map(|p| path_ends_with(p, ".out"))
        .unwrap_or(false)
    {
        in_fname.parent().unwrap().to_path_buf()
    } else if in_fname.to_string_lossy().contains("METADATA")
        || EXTS.iter().any(|e| path_ends_with(&in_fname, e))
    {
        in_fname.parent().unwrap_or(Path::new(".")).to_path_buf()
    } else {
        let mut s = in_fname.into_os_string();
        s.push(".out");
        PathBuf::from(s)
    };

    if !dir.as_os_str().is_empty() {
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }
    Ok(dir)
}

/// Путь результата для `out_fname` (создаёт подкаталоги при необходимости).
pub fn get_out_pathname(in_fname: &Path, out_fname: &str, out_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = get_out_dir(in_fname, out_dir)?;
    let rel = PathBuf::from(sanitize_fname(out_fname));
    // отрезать ведущие "/" чтобы join не ушёл в корень
    let rel: PathBuf = rel.components().filter(|c| matches!(c, std::path::Component::Normal(_))).collect();
    let result = dir.join(rel);
    if let Some(parent) = result.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
    }
    Ok(result)
}

pub fn is_glob(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

/// '*' — любая подстрока, '?' — один символ. Без классов и экранирования.
pub fn simple_glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        if p.is_empty() {
            return n.is_empty();
        }
        match p[0] {
            b'*' => {
                // схлопнуть подряд идущие '*'
                let p = {
                    let mut p = p;
                    while p.len() > 1 && p[1] == b'*' {
                        p = &p[1..];
                    }
                    p
                };
                (0..=n.len()).any(|i| inner(&p[1..], &n[i..]))
            }
            b'?' => !n.is_empty() && inner(&p[1..], &n[1..]),
            c => !n.is_empty() && n[0] == c && inner(&p[1..], &n[1..]),
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}
