//! Перевод размеров/времени в человекочитаемый вид и обратно.

use anyhow::{anyhow, Result};

/// Подбирает единицу так, чтобы числовая часть была меньше 4096.
/// `default_unit` — суффикс для «сырых» байт (например " bytes" или "").
/// `min_unit` — минимальный делитель (1 = байты, 1024 = сразу с Kb).
pub fn bytes2human_full(size: u64, default_unit: &str, min_unit: u64) -> String {
    const UNITS: [&str; 5] = ["", "Kb", "Mb", "Gb", "Tb"];

    let mut size = size;
    let mut min_unit = min_unit;
    let mut i = 0usize;
    while min_unit > 1 {
        min_unit /= 1024;
        size /= 1024;
        i += 1;
    }
    while i < UNITS.len() - 1 && size >= 4096 {
        i += 1;
        size /= 1024;
    }
    if i == 0 {
        format!("{}{}", size, default_unit)
    } else {
        format!("{}{}", size, UNITS[i])
    }
}

pub fn bytes2human(size: u64) -> String {
    bytes2human_full(size, "", 1)
}

/// Парсит "15Mb", "2GB", "0x1000", "4096". Однобуквенные суффиксы ("m")
/// трактуются как "mb".
pub fn human2bytes(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.len() > 2 && s.as_bytes()[0] == b'0' && (s.as_bytes()[1] | 0x20) == b'x' {
        return u64::from_str_radix(&s[2..], 16).map_err(|e| anyhow!("bad hex size {:?}: {}", s, e));
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let number: u64 = num
        .parse()
        .map_err(|e| anyhow!("bad size {:?}: {}", s, e))?;

    let mut unit = unit.to_ascii_lowercase();
    if unit.len() == 1 {
        unit.push('b');
    }
    let multiplier: u64 = match unit.as_str() {
        "" => 1,
        "kb" => 1 << 10,
        "mb" => 1 << 20,
        "gb" => 1 << 30,
        "tb" => 1 << 40,
        _ => return Err(anyhow!("unsupported unit: {}", unit)),
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("size out of range: {}", s))
}

/// "2d5h", "3h15m", "45s"; max_units ограничивает число разрядов.
pub fn seconds2human(seconds: u64, max_units: usize) -> String {
    const UNITS: [(u64, &str); 4] = [(86400, "d"), (3600, "h"), (60, "m"), (1, "s")];

    let mut seconds = seconds;
    let mut result = String::new();
    let mut added = 0usize;

    for (div, suffix) in UNITS {
        if seconds >= div || added > 0 {
            if added >= max_units {
                break;
            }
            let amount = seconds / div;
            seconds %= div;
            if amount > 0 || added > 0 {
                result.push_str(&amount.to_string());
                result.push_str(suffix);
                added += 1;
            }
        }
    }

    if result.is_empty() {
        "0s".to_string()
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_roundtrip_units() {
        assert_eq!(bytes2human(0), "0");
        assert_eq!(bytes2human(4095), "4095");
        assert_eq!(bytes2human(4096), "4Kb");
        assert_eq!(bytes2human(25 * 1024), "25Kb");
        assert_eq!(bytes2human(6 * 1024 * 1024 * 1024), "6144Mb");
        assert_eq!(bytes2human_full(2048, " bytes", 1), "2048 bytes");
        assert_eq!(bytes2human_full(3 * 1024 * 1024, "", 1024), "3072Kb");
    }

    #[test]
    fn human_parsing() {
        assert_eq!(human2bytes("4096").unwrap(), 4096);
        assert_eq!(human2bytes("0x1000").unwrap(), 0x1000);
        assert_eq!(human2bytes("15Mb").unwrap(), 15 << 20);
        assert_eq!(human2bytes("2GB").unwrap(), 2 << 30);
        assert_eq!(human2bytes("1m").unwrap(), 1 << 20);
        assert!(human2bytes("12qq").is_err());
    }

    #[test]
    fn seconds_formatting() {
        assert_eq!(seconds2human(0, 2), "0s");
        assert_eq!(seconds2human(45, 2), "45s");
        assert_eq!(seconds2human(3600 * 3 + 60 * 15 + 30, 2), "3h15m");
        assert_eq!(seconds2human(86400 * 2 + 3600 * 5, 2), "2d5h");
    }
}
