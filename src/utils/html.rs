/// Maximum length kept from a client-supplied activity detail.
const MAX_DETAIL_CHARS: usize = 500;

/// Cleans client-supplied free text before it lands in the audit log.
///
/// Markup outside ammonia's whitelist is stripped and the result truncated
/// to `MAX_DETAIL_CHARS` characters.
pub fn clean_detail(input: &str) -> String {
    let cleaned = ammonia::clean(input.trim());
    cleaned.chars().take(MAX_DETAIL_CHARS).collect()
}
