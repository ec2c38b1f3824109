/// Best-effort provider label for accounting, derived from a model identifier.
///
/// An explicit `vendor/model` prefix wins; otherwise well-known model
/// families are matched by name.
pub fn infer_provider(model: &str) -> String {
    let m = model.trim().to_ascii_lowercase();
    if m.is_empty() {
        return "unknown".to_string();
    }
    if let Some((vendor, _)) = m.split_once('/') {
        if !vendor.is_empty() {
            return vendor.to_string();
        }
    }

    let family = [
        ("claude", "anthropic"),
        ("gpt", "openai"),
        ("chatgpt", "openai"),
        ("o1", "openai"),
        ("o3", "openai"),
        ("o4", "openai"),
        ("gemini", "google"),
        ("deepseek", "deepseek"),
        ("mistral", "mistral"),
        ("mixtral", "mistral"),
        ("llama", "meta"),
        ("qwen", "qwen"),
    ];
    family
        .iter()
        .find(|(prefix, _)| m.starts_with(prefix))
        .map(|(_, provider)| provider.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
