//! Channel and user mode strings.
//!
//! Channel modes fall into five classes that decide whether a parameter is
//! consumed:
//! - list modes (`b`, `e`, `I`) always take a mask
//! - prefix modes (`q`, `o`, `h`, `v`) always take a nick
//! - `k` takes its key when set and when unset
//! - `l` takes its limit only when set
//! - everything else is a plain flag

/// How a channel mode character behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    /// Mask list such as bans.
    List,
    /// Membership privilege, carrying its nick-list symbol.
    Prefix(char),
    /// Parameter on both set and unset.
    ParamAlways,
    /// Parameter only on set.
    ParamOnSet,
    /// No parameter.
    Flag,
}

impl ModeKind {
    /// Whether a change of this kind consumes a parameter.
    pub fn takes_arg(self, adding: bool) -> bool {
        match self {
            ModeKind::List | ModeKind::Prefix(_) | ModeKind::ParamAlways => true,
            ModeKind::ParamOnSet => adding,
            ModeKind::Flag => false,
        }
    }
}

/// Prefix modes in rank order, highest first.
pub const PREFIX_MODES: [(char, char); 4] = [('q', '~'), ('o', '@'), ('h', '%'), ('v', '+')];

/// Classify a channel mode character.
pub fn channel_mode_kind(mode: char) -> ModeKind {
    match mode {
        'b' | 'e' | 'I' => ModeKind::List,
        'k' => ModeKind::ParamAlways,
        'l' => ModeKind::ParamOnSet,
        _ => match mode_to_prefix(mode) {
            Some(symbol) => ModeKind::Prefix(symbol),
            None => ModeKind::Flag,
        },
    }
}

/// `@` for `o`, and so on.
pub fn mode_to_prefix(mode: char) -> Option<char> {
    PREFIX_MODES
        .iter()
        .find(|(m, _)| *m == mode)
        .map(|(_, s)| *s)
}

/// `o` for `@`, and so on.
pub fn prefix_to_mode(symbol: char) -> Option<char> {
    PREFIX_MODES
        .iter()
        .find(|(_, s)| *s == symbol)
        .map(|(m, _)| *m)
}

/// Whether `c` is a nick-list prefix symbol.
pub fn is_prefix_symbol(c: char) -> bool {
    prefix_to_mode(c).is_some()
}

/// One `+x arg` or `-x` element of a mode string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    /// `true` for `+`.
    pub adding: bool,
    /// Mode character.
    pub mode: char,
    /// Parameter, if the mode consumed one.
    pub arg: Option<String>,
}

impl ModeChange {
    /// A `+mode` change.
    pub fn plus(mode: char, arg: Option<String>) -> Self {
        Self {
            adding: true,
            mode,
            arg,
        }
    }

    /// A `-mode` change.
    pub fn minus(mode: char, arg: Option<String>) -> Self {
        Self {
            adding: false,
            mode,
            arg,
        }
    }
}

/// Parse a channel mode string and its parameters.
///
/// A mode that needs a parameter but has none left is dropped.
pub fn parse_channel_modes(modes: &str, args: &[String]) -> Vec<ModeChange> {
    let mut out = Vec::new();
    let mut args = args.iter();
    let mut adding = true;
    for c in modes.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            _ => {
                let arg = if channel_mode_kind(c).takes_arg(adding) {
                    match args.next() {
                        Some(a) => Some(a.clone()),
                        None => continue,
                    }
                } else {
                    None
                };
                out.push(ModeChange {
                    adding,
                    mode: c,
                    arg,
                });
            }
        }
    }
    out
}

/// Parse a user mode string. User modes never take parameters here.
pub fn parse_user_modes(modes: &str) -> Vec<ModeChange> {
    let mut out = Vec::new();
    let mut adding = true;
    for c in modes.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            _ => out.push(ModeChange {
                adding,
                mode: c,
                arg: None,
            }),
        }
    }
    out
}

/// Render changes back to `(mode string, params)`, emitting a sign only
/// when it flips.
pub fn format_mode_changes(changes: &[ModeChange]) -> (String, Vec<String>) {
    let mut modes = String::new();
    let mut args = Vec::new();
    let mut sign = None;
    for change in changes {
        if sign != Some(change.adding) {
            modes.push(if change.adding { '+' } else { '-' });
            sign = Some(change.adding);
        }
        modes.push(change.mode);
        if let Some(arg) = &change.arg {
            args.push(arg.clone());
        }
    }
    (modes, args)
}

/// Sort prefix symbols into rank order (`~@%+`), dropping unknown ones.
pub fn normalize_prefixes(symbols: &str) -> String {
    PREFIX_MODES
        .iter()
        .filter(|(_, s)| symbols.contains(*s))
        .map(|(_, s)| *s)
        .collect()
}
