//! Двухбуферный последовательный проход: один поток читает, второй
//! сканирует; рукопожатие через Mutex + Condvar. При ошибке чтения в
//! force-режиме буфер добивается посекторно, нечитаемые сектора
//! остаются нулями.

use anyhow::{anyhow, Result};
use log::{error, trace};
use std::sync::{Condvar, Mutex};

use crate::io::{is_read_error, Reader};

pub const SCAN_BUF_SIZE: usize = 8 * 1024 * 1024;

struct Shared {
    // готовые к сканированию буферы: (данные, смещение в файле)
    slots: [Option<(Vec<u8>, u64)>; 2],
    done: bool,
    abort: bool,
    read_error: Option<String>,
}

/// Читает нечитаемый регион по секторам, заполняя дыры нулями.
fn read_by_sector(reader: &Reader, pos: u64, buf: &mut [u8]) -> usize {
    let mut sector = reader.align() as usize;
    if sector <= 1 {
        sector = 512;
    }

    buf.fill(0);
    let mut nread = 0usize;
    while nread < buf.len() {
        let chunk = sector.min(buf.len() - nread);
        match reader.read_at(pos + nread as u64, &mut buf[nread..nread + chunk]) {
            Ok(0) => break,
            Ok(n) => nread += n,
            Err(e) => {
                trace!("{:#x}: {}", pos + nread as u64, e);
                nread += sector; // пропустить сектор
            }
        }
    }
    nread.min(buf.len())
}

/// Гонит `process` по файлу от `start` блоками по SCAN_BUF_SIZE.
pub fn scan(
    reader: &Reader,
    start: u64,
    force: bool,
    mut process: impl FnMut(&[u8], u64) -> Result<()>,
) -> Result<()> {
    let shared = Mutex::new(Shared {
        slots: [None, None],
        done: false,
        abort: false,
        read_error: None,
    });
    let cv = Condvar::new();

    std::thread::scope(|scope| -> Result<()> {
        // поток чтения
        scope.spawn(|| {
            let mut pos = start;
            let mut buf_idx = 0usize;
            while pos < reader.size() {
                let to_read = SCAN_BUF_SIZE.min((reader.size() - pos) as usize);
                let mut buf = vec![0u8; to_read];

                let nread = match reader.read_at(pos, &mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        error!("{} @ {:#x}: {}", reader.fname().display(), pos, e);
                        if force && is_read_error(&e) {
                            read_by_sector(reader, pos, &mut buf)
                        } else {
                            let mut st = shared.lock().expect("scanner mutex");
                            st.read_error = Some(format!("{:#}", e));
                            st.done = true;
                            cv.notify_all();
                            return;
                        }
                    }
                };
                if nread == 0 {
                    error!("{}: unexpected EOF at {:#x}", reader.fname().display(), pos);
                    break;
                }
                buf.truncate(nread);

                let mut st = shared.lock().expect("scanner mutex");
                while st.slots[buf_idx].is_some() && !st.abort {
                    st = cv.wait(st).expect("scanner condvar");
                }
                if st.abort {
                    return;
                }
                st.slots[buf_idx] = Some((buf, pos));
                drop(st);
                cv.notify_all();

                pos += nread as u64;
                buf_idx = 1 - buf_idx;
            }

            let mut st = shared.lock().expect("scanner mutex");
            st.done = true;
            drop(st);
            cv.notify_all();
        });

        // сканирующая сторона (текущий поток)
        let mut buf_idx = 0usize;
        loop {
            let item = {
                let mut st = shared.lock().expect("scanner mutex");
                loop {
                    if st.slots[buf_idx].is_some() {
                        break st.slots[buf_idx].take();
                    }
                    if st.done {
                        break None;
                    }
                    st = cv.wait(st).expect("scanner condvar");
                }
            };
            cv.notify_all();

            let Some((buf, offset)) = item else {
                break;
            };
            if let Err(e) = process(&buf, offset) {
                let mut st = shared.lock().expect("scanner mutex");
                st.abort = true;
                drop(st);
                cv.notify_all();
                return Err(e);
            }
            buf_idx = 1 - buf_idx;
        }

        let st = shared.lock().expect("scanner mutex");
        if let Some(e) = &st.read_error {
            return Err(anyhow!("scan aborted: {}", e));
        }
        Ok(())
    })
}
