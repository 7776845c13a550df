use unicode_normalization::UnicodeNormalization;

use crate::model::ChatRequest;

fn clean_text(s: &str) -> String {
    // NFC, BOM strip, CRLF -> LF, trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

fn clamp_round_f32(x: f32, lo: f32, hi: f32, dp: u32) -> f32 {
    let clamped = x.clamp(lo, hi);
    let p = 10f32.powi(dp as i32);
    (clamped * p).round() / p
}

/// Clean an outgoing request before it is sent upstream.
/// Unset sampling parameters stay unset so the provider default applies.
pub fn normalize_chat(mut req: ChatRequest) -> ChatRequest {
    req.model = req.model.trim().to_string();
    for msg in &mut req.messages {
        msg.content = clean_text(&msg.content);
    }
    req.temperature = req.temperature.map(|t| clamp_round_f32(t, 0.0, 2.0, 3));
    req.top_p = req.top_p.map(|p| clamp_round_f32(p, 0.0, 1.0, 4));
    if let Some(stops) = &mut req.stop_sequences {
        stops.retain(|s| !s.is_empty());
        stops.sort();
        stops.dedup();
        if stops.is_empty() {
            req.stop_sequences = None;
        }
    }
    if matches!(&req.tools, Some(t) if t.is_empty()) {
        req.tools = None;
    }
    req
}
