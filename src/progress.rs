//! Прогресс длинных проходов: троттлинг ~10 Гц, ETA по пройденным байтам,
//! счётчики находок по категориям.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Instant;

use crate::units::{bytes2human, seconds2human};

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

pub struct Progress {
    fsize: u64,
    start_offset: u64,
    start_time: Instant,
    prev_time: Instant,
    found_map: BTreeMap<&'static str, u64>,
    spinner_idx: usize,
}

impl Progress {
    pub fn new(fsize: u64, start_offset: u64) -> Self {
        let now = Instant::now();
        Self {
            fsize,
            start_offset,
            start_time: now,
            prev_time: now,
            found_map: BTreeMap::new(),
            spinner_idx: 0,
        }
    }

    pub fn found(&mut self, key: &'static str) {
        *self.found_map.entry(key).or_insert(0) += 1;
    }

    pub fn update(&mut self, offset: u64) {
        self.render(offset, false);
    }

    pub fn finish(&mut self) {
        let fsize = self.fsize;
        self.render(fsize, true);
    }

    fn render(&mut self, offset: u64, fin: bool) {
        let now = Instant::now();
        if !fin && now.duration_since(self.prev_time).as_millis() < 100 {
            return;
        }
        self.prev_time = now;

        let elapsed = now.duration_since(self.start_time).as_secs();
        let done = offset.saturating_sub(self.start_offset);
        let total = self.fsize.saturating_sub(self.start_offset);
        let percent = if total == 0 {
            100.0
        } else {
            100.0 * done as f64 / total as f64
        };

        let eta = if done > 0 && elapsed > 0 && done < total {
            let rate = done / elapsed;
            if rate > 0 {
                seconds2human((total - done) / rate, 2)
            } else {
                "?".to_string()
            }
        } else {
            "0s".to_string()
        };

        self.spinner_idx = (self.spinner_idx + 1) % SPINNER.len();
        let spin = if fin { ' ' } else { SPINNER[self.spinner_idx] };

        let mut counters = String::new();
        for (key, n) in &self.found_map {
            counters.push_str(&format!(" {}: {}", key, n));
        }

        eprint!(
            "\r{} {:6.2}% {}/{} ETA {}{}   ",
            spin,
            percent,
            bytes2human(done),
            bytes2human(total),
            eta,
            counters
        );
        if fin {
            eprintln!();
        }
        let _ = std::io::stderr().flush();
    }
}
