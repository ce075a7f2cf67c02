/// Truncate `s` to at most `max_bytes` bytes on a char boundary, appending
/// `...` when anything was cut.
pub fn truncate_str(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    format!("{}...", &s[..s.floor_char_boundary(max_bytes)])
}
