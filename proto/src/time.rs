/// Format milliseconds as MM:SS.mmm or HH:MM:SS.mmm
pub fn format_time(ms: i64) -> String {
    let ms = ms.max(0);
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    let millis = ms % 1000;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
    } else {
        format!("{:02}:{:02}.{:03}", minutes, secs, millis)
    }
}

/// Parse `HH:MM:SS`, `MM:SS` (optionally with `.mmm`) or a plain millisecond count
pub fn parse_time(input: &str) -> Option<i64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if !input.contains(':') {
        return input.parse::<i64>().ok().filter(|ms| *ms >= 0);
    }

    let (clock, millis) = match input.split_once('.') {
        Some((clock, frac)) => {
            let digits = frac.get(..frac.len().min(3))?;
            let scale = 10_i64.pow(3 - digits.len() as u32);
            (clock, digits.parse::<i64>().ok().filter(|v| *v >= 0)? * scale)
        }
        None => (input, 0),
    };

    let mut total = 0_i64;
    let parts: Vec<&str> = clock.split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    for part in parts {
        let value = part.parse::<i64>().ok().filter(|v| *v >= 0)?;
        total = total.checked_mul(60)?.checked_add(value)?;
    }
    total.checked_mul(1000)?.checked_add(millis)
}
