//! A small Wadler-style document algebra.
//!
//! A `Group` is laid out flat when it fits in the remaining width (measured
//! up to the next break outside the group), otherwise its `Line`s become
//! newlines at the current nesting.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Doc {
    Text(String),
    /// A space when flat, a newline when broken.
    Line,
    /// Nothing when flat, a newline when broken.
    SoftLine,
    /// Always a newline; a group containing it never fits flat.
    HardLine,
    Concat(Vec<Doc>),
    Nest(usize, Box<Doc>),
    Group(Box<Doc>),
}

impl Doc {
    pub(crate) fn text(s: impl Into<String>) -> Doc {
        Doc::Text(s.into())
    }

    pub(crate) fn concat(parts: impl IntoIterator<Item = Doc>) -> Doc {
        Doc::Concat(parts.into_iter().collect())
    }

    pub(crate) fn nest(indent: usize, doc: Doc) -> Doc {
        Doc::Nest(indent, Box::new(doc))
    }

    pub(crate) fn group(doc: Doc) -> Doc {
        Doc::Group(Box::new(doc))
    }

    /// `items` separated by `sep`.
    pub(crate) fn join(items: impl IntoIterator<Item = Doc>, sep: Doc) -> Doc {
        let mut parts = Vec::new();
        for (idx, item) in items.into_iter().enumerate() {
            if idx > 0 {
                parts.push(sep.clone());
            }
            parts.push(item);
        }
        Doc::Concat(parts)
    }

    pub(crate) fn render(&self, width: usize) -> String {
        let mut out = String::new();
        let mut column = 0;
        let mut stack: Vec<(usize, Mode, &Doc)> = vec![(0, Mode::Break, self)];

        while let Some((indent, mode, doc)) = stack.pop() {
            match doc {
                Doc::Text(s) => {
                    out.push_str(s);
                    column += s.chars().count();
                }
                Doc::Line | Doc::SoftLine if mode == Mode::Flat => {
                    if matches!(doc, Doc::Line) {
                        out.push(' ');
                        column += 1;
                    }
                }
                Doc::Line | Doc::SoftLine | Doc::HardLine => {
                    newline(&mut out, indent);
                    column = indent;
                }
                Doc::Concat(parts) => {
                    for part in parts.iter().rev() {
                        stack.push((indent, mode, part));
                    }
                }
                Doc::Nest(extra, inner) => stack.push((indent + extra, mode, inner)),
                Doc::Group(inner) => {
                    let flat = mode == Mode::Flat
                        || fits(width.saturating_sub(column), inner, &stack);
                    let mode = if flat { Mode::Flat } else { Mode::Break };
                    stack.push((indent, mode, inner));
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Flat,
    Break,
}

fn newline(out: &mut String, indent: usize) {
    while out.ends_with(' ') {
        out.pop();
    }
    out.push('\n');
    out.extend(std::iter::repeat_n(' ', indent));
}

/// Whether `doc` laid out flat, plus whatever follows it up to the next
/// break, fits in `remaining` columns.
fn fits(remaining: usize, doc: &Doc, rest: &[(usize, Mode, &Doc)]) -> bool {
    let mut remaining = remaining as isize;
    let mut pending: Vec<(Mode, &Doc)> = vec![(Mode::Flat, doc)];
    let mut rest = rest.iter().rev();

    loop {
        let (mode, doc) = match pending.pop() {
            Some(item) => item,
            None => match rest.next() {
                Some((_, mode, doc)) => (*mode, *doc),
                None => return true,
            },
        };
        match doc {
            Doc::Text(s) => {
                remaining -= s.chars().count() as isize;
                if remaining < 0 {
                    return false;
                }
            }
            Doc::Line if mode == Mode::Flat => remaining -= 1,
            Doc::SoftLine if mode == Mode::Flat => {}
            Doc::HardLine if mode == Mode::Flat => return false,
            Doc::Line | Doc::SoftLine | Doc::HardLine => return true,
            Doc::Concat(parts) => pending.extend(parts.iter().rev().map(|p| (mode, p))),
            Doc::Nest(_, inner) => pending.push((mode, inner)),
            // Groups outside the measured one keep their own decision.
            Doc::Group(inner) => pending.push((mode, inner)),
        }
        if remaining < 0 {
            return false;
        }
    }
}
