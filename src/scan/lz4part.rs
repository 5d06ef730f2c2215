//! Частичное LZ4-декодирование для сканера.
//!
//! Сканеру размер сжатого блока заранее неизвестен: на вход идёт окно в
//! LZ4_COMPRESSBOUND(srcSize) байт, возможно с мусором после конца блока.
//! Декодер останавливается, как только выдал want байт, и сообщает,
//! сколько входа было потреблено — у корректного блока последняя
//! последовательность состоит из одних литералов, так что consumed
//! совпадает с реальным размером сжатого потока.

use anyhow::{anyhow, Result};

/// Худший случай раздувания LZ4 (аналог LZ4_COMPRESSBOUND).
pub fn compress_bound(src_size: usize) -> usize {
    src_size + src_size / 255 + 16
}

/// Возвращает (распакованные байты, потреблено входа).
pub fn decompress_partial(input: &[u8], want: usize) -> Result<(Vec<u8>, usize)> {
    let mut out: Vec<u8> = Vec::with_capacity(want);
    let mut pos = 0usize;

    loop {
        let token = *input
            .get(pos)
            .ok_or_else(|| anyhow!("lz4: truncated at token"))?;
        pos += 1;

        // литералы
        let mut lit_len = (token >> 4) as usize;
        if lit_len == 15 {
            loop {
                let b = *input
                    .get(pos)
                    .ok_or_else(|| anyhow!("lz4: truncated in literal length"))?;
                pos += 1;
                lit_len += b as usize;
                if b != 255 {
                    break;
                }
            }
        }
        let lits = input
            .get(pos..pos + lit_len)
            .ok_or_else(|| anyhow!("lz4: truncated literals"))?;
        out.extend_from_slice(lits);
        pos += lit_len;

        if out.len() >= want {
            out.truncate(want);
            return Ok((out, pos));
        }
        if pos == input.len() {
            // естественный конец: последняя последовательность без матча
            return Ok((out, pos));
        }

        // матч
        let off_bytes = input
            .get(pos..pos + 2)
            .ok_or_else(|| anyhow!("lz4: truncated offset"))?;
        let offset = u16::from_le_bytes([off_bytes[0], off_bytes[1]]) as usize;
        pos += 2;
        if offset == 0 || offset > out.len() {
            return Err(anyhow!("lz4: bad match offset {}", offset));
        }

        let mut match_len = (token & 0x0f) as usize;
        if match_len == 15 {
            loop {
                let b = *input
                    .get(pos)
                    .ok_or_else(|| anyhow!("lz4: truncated in match length"))?;
                pos += 1;
                match_len += b as usize;
                if b != 255 {
                    break;
                }
            }
        }
        match_len += 4;

        // копирование может перекрываться — только побайтно
        let start = out.len() - offset;
        for k in 0..match_len {
            let b = out[start + k];
            out.push(b);
        }

        if out.len() >= want {
            out.truncate(want);
            return Ok((out, pos));
        }
    }
}
