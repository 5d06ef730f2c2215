//! Оценка слотов контейнера: какой из двух снапшотов пригоднее.
//!
//! Каждый слот получает оценку по числу банков, которые читаются,
//! проходят valid_fast и бьются по CRC/размеру из BankInfo. Выбирается
//! слот с максимумом валидных банков; если объединение слотов накрывает
//! больше банков, чем лучший по отдельности, вызывающему стоит
//! предложить сканер.

use anyhow::{anyhow, Result};
use log::{debug, error, info};

use crate::consts::{MAX_SLOTS, PAGE_SIZE};
use crate::io::Reader;
use crate::util::{filter_unprintable, vcrc32};
use crate::vbk::bank::{bank_valid_fast, BankHeader};
use crate::vbk::header::FileHeader;
use crate::vbk::slot::CSlot;

pub struct SlotScore {
    pub index: usize,
    pub offset: u64,
    pub storage_eof: u64,
    pub banks_ok: Vec<bool>,
}

impl SlotScore {
    pub fn score(&self) -> usize {
        self.banks_ok.iter().filter(|&&b| b).count()
    }
}

pub struct SlotSurvey {
    pub header_valid: bool,
    pub slot_fmt: u32,
    pub slot_size: usize,
    pub scores: Vec<SlotScore>,
}

impl SlotSurvey {
    pub fn best(&self) -> Option<&SlotScore> {
        self.scores
            .iter()
            .filter(|s| s.score() > 0)
            .max_by_key(|s| s.score())
    }

    /// Дало бы объединение слотов больше валидных банков, чем лучший?
    pub fn merge_would_help(&self) -> bool {
        let mut merged: Vec<bool> = Vec::new();
        for s in &self.scores {
            if merged.len() < s.banks_ok.len() {
                merged.resize(s.banks_ok.len(), false);
            }
            for (i, &b) in s.banks_ok.iter().enumerate() {
                merged[i] |= b;
            }
        }
        let merged_score = merged.iter().filter(|&&b| b).count();
        self.best().map(|b| merged_score > b.score()).unwrap_or(false)
    }
}

/// Читает заголовок контейнера и оценивает оба слота (или один явный).
pub fn evaluate_slots(
    reader: &Reader,
    offset: u64,
    explicit_slot: Option<usize>,
) -> Result<SlotSurvey> {
    let mut hdr_buf = vec![0u8; PAGE_SIZE];
    let _ = reader.read_at(offset, &mut hdr_buf)?;
    let hdr = FileHeader::parse(&hdr_buf).ok_or_else(|| anyhow!("container is too short"))?;
    info!("{:08x}: {}", offset, filter_unprintable(&hdr.to_string()));

    let header_valid = hdr.valid();
    let slot_size = if header_valid { hdr.slot_size() } else { 0x80000 };
    debug!("max_banks: {:x}, slot_size: {:x}", hdr.max_banks(), slot_size);

    let mut survey = SlotSurvey {
        header_valid,
        slot_fmt: hdr.slot_fmt,
        slot_size,
        scores: Vec::new(),
    };

    let mut slot_buf = vec![0u8; slot_size];
    let mut storage_eof = 0u64;
    let mut tail_offset = 0u64;

    for slot_idx in 0..MAX_SLOTS {
        if let Some(explicit) = explicit_slot {
            if explicit != slot_idx {
                continue;
            }
        }
        let slot_offset = offset + PAGE_SIZE as u64 + (slot_idx * slot_size) as u64;
        slot_buf.fill(0);
        let _ = reader.read_at(slot_offset, &mut slot_buf)?;

        let Some(slot_hdr) = CSlot::parse_header(&slot_buf) else {
            continue;
        };
        let valid = slot_hdr.size() <= slot_size
            && slot_hdr.valid_fast()
            && slot_hdr.valid_crc(&slot_buf);
        info!(
            "{:08x}: slot[{}]: {} {}",
            slot_offset,
            slot_idx,
            slot_hdr,
            if valid { "[ok]" } else { "[bad]" }
        );
        if !valid {
            continue;
        }

        let mut slot = slot_hdr;
        slot.parse_bank_infos(&slot_buf);
        info!("  {}", slot.snapshot);
        if slot.snapshot.storage_eof > reader.size() {
            error!(
                "  storage_eof {:x} > actual EOF {:x}",
                slot.snapshot.storage_eof,
                reader.size()
            );
        }
        storage_eof = storage_eof.max(slot.snapshot.storage_eof);

        let mut banks_ok = vec![false; slot.allocated_banks as usize];
        for (i, bi) in slot.bank_infos.iter().enumerate() {
            let mut bank_buf = vec![0u8; bi.size as usize];
            let nread = reader.read_at(offset + bi.offset as u64, &mut bank_buf)?;
            tail_offset = tail_offset.max(offset + bi.offset as u64 + bi.size as u64);

            let actual_size = BankHeader::parse(&bank_buf)
                .map(|h| h.bank_size() as u32)
                .unwrap_or(0);
            let actual_crc = vcrc32(0, &bank_buf[..nread]);
            let ok = nread == bi.size as usize
                && bank_valid_fast(&bank_buf)
                && actual_crc == bi.crc
                && actual_size == bi.size;
            banks_ok[i] = ok;
            if ok {
                info!("    bank {:02x}: {}", i, bi);
            } else {
                info!(
                    "    bank {:02x}: {} [actual crc {:08x}][actual size {:x}]",
                    i, bi, actual_crc, actual_size
                );
            }
        }

        survey.scores.push(SlotScore {
            index: slot_idx,
            offset: slot_offset,
            storage_eof: slot.snapshot.storage_eof,
            banks_ok,
        });
    }

    if storage_eof != 0 && storage_eof > tail_offset {
        log::warn!(
            "{:012x}: {:x} bytes of data not covered by banks",
            tail_offset,
            storage_eof - tail_offset
        );
    }

    Ok(survey)
}
