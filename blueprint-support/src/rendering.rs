//! Rendering helpers for diagnostics: component chains, optional names,
//! short type names and "did you mean" suggestions.

/// Shown in place of the name of an anonymous (inlined) component.
pub const ANONYMOUS: &str = "<anonymous>";

/// Joins a component chain with arrows.
///
/// # Examples
/// ```
/// use blueprint_support::rendering::render_chain;
///
/// let rendered = render_chain(&["userService", "userRepo", "userService"]);
/// assert_eq!(rendered, "userService → userRepo → userService");
/// ```
pub fn render_chain(chain: &[impl AsRef<str>]) -> String {
    render_joined(chain, " → ")
}

/// Joins names with commas, e.g. the filters of unsatisfied references.
///
/// ```
/// use blueprint_support::rendering::render_list;
///
/// assert_eq!(render_list(&["(objectClass=A)", "(objectClass=B)"]), "(objectClass=A), (objectClass=B)");
/// ```
pub fn render_list(items: &[impl AsRef<str>]) -> String {
    render_joined(items, ", ")
}

fn render_joined(items: &[impl AsRef<str>], separator: &str) -> String {
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        out.push_str(item.as_ref());
    }
    out
}

/// An optional component name, or [`ANONYMOUS`].
///
/// ```
/// use blueprint_support::rendering::display_name;
///
/// assert_eq!(display_name(Some("greeter")), "greeter");
/// assert_eq!(display_name(None), "<anonymous>");
/// ```
pub fn display_name(name: Option<&str>) -> &str {
    name.unwrap_or(ANONYMOUS)
}

/// Drops module paths from a type name, keeping generic structure.
///
/// ```
/// use blueprint_support::rendering::shorten_type_name;
///
/// assert_eq!(shorten_type_name("app::clock::SystemClock"), "SystemClock");
/// assert_eq!(
///     shorten_type_name("alloc::sync::Arc<dyn app::listener::Tracker>"),
///     "Arc<dyn Tracker>"
/// );
/// ```
pub fn shorten_type_name(full_name: &str) -> String {
    let mut out = String::with_capacity(full_name.len());
    let mut start = 0;

    for (i, ch) in full_name.char_indices() {
        if matches!(ch, '<' | '>' | ',' | ' ' | '(' | ')' | '[' | ']' | ';' | '&') {
            push_last_segment(&mut out, &full_name[start..i]);
            out.push(ch);
            start = i + ch.len_utf8();
        }
    }
    push_last_segment(&mut out, &full_name[start..]);
    out
}

fn push_last_segment(out: &mut String, path: &str) {
    out.push_str(path.rsplit("::").next().unwrap_or(path));
}

/// Levenshtein distance over characters, case-insensitive.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Registered names close to `requested`, closest first.
///
/// A name qualifies when its edit distance is at most a third of the
/// requested length (never less than two). Ties are broken alphabetically.
pub fn suggest_similar(requested: &str, available: &[&str], max_suggestions: usize) -> Vec<String> {
    if requested.is_empty() {
        return Vec::new();
    }
    let threshold = (requested.chars().count() / 3).max(2);

    let mut scored: Vec<(usize, &str)> = available
        .iter()
        .copied()
        .filter(|&name| name != requested)
        .map(|name| (edit_distance(requested, name), name))
        .filter(|&(distance, _)| distance <= threshold)
        .collect();

    scored.sort_unstable();
    scored
        .into_iter()
        .take(max_suggestions)
        .map(|(_, name)| name.to_string())
        .collect()
}
