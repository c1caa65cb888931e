//! Per-recipient template variable substitution.

use std::collections::BTreeMap;

use engage_core::types::ListMember;

/// Replace `{{field}}` placeholders with the member's fields.
/// `{{recipient_id}}` and `{{address}}` are always available; unknown
/// placeholders are left as written.
pub fn render(text: &str, member: &ListMember) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }
    let mut out = text.replace("{{recipient_id}}", &member.recipient_id);
    if let Some(address) = &member.address {
        out = out.replace("{{address}}", address);
    }
    for (key, value) in &member.fields {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Render every variable value for one recipient.
pub fn render_variables(
    variables: &BTreeMap<String, String>,
    member: &ListMember,
) -> BTreeMap<String, String> {
    variables
        .iter()
        .map(|(k, v)| (k.clone(), render(v, member)))
        .collect()
}
