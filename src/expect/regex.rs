//! Minimal-lookahead regular expressions for streaming match.
//!
//! A self-contained parser, Thompson NFA compiler, and stepper built for
//! one job: first-match search over a live byte stream where over-reading
//! is a correctness bug: bytes past the match belong to whatever comes
//! next on the wire. Mainstream engines batch their input and keep their
//! stepping machinery private, so this subset is implemented directly
//! against a pull-one-rune source.
//!
//! Supported syntax: literals, `.` (any rune except `\n`), `[...]` /
//! `[^...]` with ranges, `(...)` grouping, `|` alternation, `*` `+` `?`
//! repetition, `^` (anchors to the search origin), and escapes
//! (`\d \D \w \W \s \S \n \r \t` plus escaped punctuation). `$` is
//! rejected: asserting end-of-input requires reading past the match, which
//! this engine exists to avoid.
//!
//! Match semantics are **leftmost-first** in the streaming sense: the
//! simulation runs one rune at a time and commits at the first position
//! where *any* alternative completes, never pulling input beyond that
//! decision.

use std::io;

use anyhow::{bail, Result};

/// A source of runes pulled one at a time, exactly as needed.
///
/// End-of-stream and timeout surface as `io::Error` (`UnexpectedEof` /
/// `TimedOut`) and are propagated unchanged by the search.
pub trait RuneSource {
    /// Pull the next rune.
    fn next_rune(&mut self) -> io::Result<char>;
}

#[derive(Debug, Clone)]
enum Ast {
    Empty,
    Literal(char),
    AnyRune,
    Class { ranges: Vec<(char, char)>, negated: bool },
    Begin,
    Concat(Vec<Ast>),
    Alternate(Vec<Ast>),
    Star(Box<Ast>),
    Plus(Box<Ast>),
    Quest(Box<Ast>),
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Parser<'a> {
    fn new(pattern: &'a str) -> Self {
        Self { chars: pattern.chars().peekable() }
    }

    fn parse(mut self) -> Result<Ast> {
        let ast = self.alternate()?;
        if let Some(c) = self.chars.next() {
            bail!("unexpected {c:?} (unbalanced ')'?)");
        }
        Ok(ast)
    }

    fn alternate(&mut self) -> Result<Ast> {
        let mut branches = vec![self.concat()?];
        while self.chars.peek() == Some(&'|') {
            self.chars.next();
            branches.push(self.concat()?);
        }
        Ok(if branches.len() == 1 {
            branches.pop().expect("one branch")
        } else {
            Ast::Alternate(branches)
        })
    }

    fn concat(&mut self) -> Result<Ast> {
        let mut parts = Vec::new();
        while let Some(&c) = self.chars.peek() {
            if c == '|' || c == ')' {
                break;
            }
            parts.push(self.repeat()?);
        }
        Ok(match parts.len() {
            0 => Ast::Empty,
            1 => parts.pop().expect("one part"),
            _ => Ast::Concat(parts),
        })
    }

    fn repeat(&mut self) -> Result<Ast> {
        let atom = self.atom()?;
        match self.chars.peek() {
            Some('*') => {
                self.chars.next();
                self.reject_repeatable(&atom, '*')?;
                Ok(Ast::Star(Box::new(atom)))
            }
            Some('+') => {
                self.chars.next();
                self.reject_repeatable(&atom, '+')?;
                Ok(Ast::Plus(Box::new(atom)))
            }
            Some('?') => {
                self.chars.next();
                self.reject_repeatable(&atom, '?')?;
                Ok(Ast::Quest(Box::new(atom)))
            }
            Some('{') => bail!("counted repetition {{m,n}} is not supported"),
            _ => Ok(atom),
        }
    }

    fn reject_repeatable(&self, atom: &Ast, op: char) -> Result<()> {
        if matches!(atom, Ast::Empty | Ast::Begin) {
            bail!("nothing to repeat before {op:?}");
        }
        Ok(())
    }

    fn atom(&mut self) -> Result<Ast> {
        let c = match self.chars.next() {
            Some(c) => c,
            None => return Ok(Ast::Empty),
        };
        match c {
            '(' => {
                let inner = self.alternate()?;
                match self.chars.next() {
                    Some(')') => Ok(inner),
                    _ => bail!("missing closing ')'"),
                }
            }
            '[' => self.class(),
            '.' => Ok(Ast::AnyRune),
            '^' => Ok(Ast::Begin),
            '$' => bail!("'$' is not supported: a streaming match cannot assert end of input"),
            '*' | '+' | '?' => bail!("nothing to repeat before {c:?}"),
            '\\' => self.escape(),
            c => Ok(Ast::Literal(c)),
        }
    }

    fn escape(&mut self) -> Result<Ast> {
        let c = match self.chars.next() {
            Some(c) => c,
            None => bail!("trailing backslash"),
        };
        Ok(match c {
            'n' => Ast::Literal('\n'),
            'r' => Ast::Literal('\r'),
            't' => Ast::Literal('\t'),
            'd' => Ast::Class { ranges: vec![('0', '9')], negated: false },
            'D' => Ast::Class { ranges: vec![('0', '9')], negated: true },
            'w' => Ast::Class { ranges: word_ranges(), negated: false },
            'W' => Ast::Class { ranges: word_ranges(), negated: true },
            's' => Ast::Class { ranges: space_ranges(), negated: false },
            'S' => Ast::Class { ranges: space_ranges(), negated: true },
            c if c.is_ascii_alphanumeric() => bail!("unknown escape \\{c}"),
            c => Ast::Literal(c),
        })
    }

    fn class(&mut self) -> Result<Ast> {
        let negated = if self.chars.peek() == Some(&'^') {
            self.chars.next();
            true
        } else {
            false
        };
        let mut ranges = Vec::new();
        let mut first = true;
        loop {
            let c = match self.chars.next() {
                Some(c) => c,
                None => bail!("missing closing ']'"),
            };
            if c == ']' && !first {
                break;
            }
            first = false;
            let lo = if c == '\\' {
                match self.escape()? {
                    Ast::Literal(l) => l,
                    Ast::Class { ranges: r, negated: false } => {
                        // \d etc. inside a class contributes its ranges.
                        ranges.extend(r);
                        continue;
                    }
                    _ => bail!("unsupported escape inside character class"),
                }
            } else {
                c
            };
            if self.chars.peek() == Some(&'-') {
                self.chars.next();
                match self.chars.peek() {
                    Some(&']') | None => {
                        // Trailing '-' is a literal.
                        ranges.push((lo, lo));
                        ranges.push(('-', '-'));
                    }
                    Some(_) => {
                        let hi = match self.chars.next() {
                            Some('\\') => match self.escape()? {
                                Ast::Literal(l) => l,
                                _ => bail!("bad range end in character class"),
                            },
                            Some(h) => h,
                            None => bail!("missing closing ']'"),
                        };
                        if hi < lo {
                            bail!("inverted range {lo:?}-{hi:?} in character class");
                        }
                        ranges.push((lo, hi));
                    }
                }
            } else {
                ranges.push((lo, lo));
            }
        }
        if ranges.is_empty() {
            bail!("empty character class");
        }
        Ok(Ast::Class { ranges, negated })
    }
}

fn word_ranges() -> Vec<(char, char)> {
    vec![('a', 'z'), ('A', 'Z'), ('0', '9'), ('_', '_')]
}

fn space_ranges() -> Vec<(char, char)> {
    vec![(' ', ' '), ('\t', '\t'), ('\n', '\n'), ('\r', '\r'), ('\x0b', '\x0c')]
}

#[derive(Debug, Clone)]
enum Inst {
    Rune(char),
    AnyRune,
    Class { ranges: Vec<(char, char)>, negated: bool },
    /// Assert the thread sits at the search origin.
    Begin,
    Split(usize, usize),
    Jump(usize),
    Match,
}

/// A compiled pattern, reusable across searches and threads.
#[derive(Debug, Clone)]
pub struct Regex {
    pattern: String,
    prog: Vec<Inst>,
}

impl Regex {
    /// Compile `pattern`. Failure leaves no state behind; the caller may
    /// retry with a corrected pattern.
    pub fn compile(pattern: &str) -> Result<Self> {
        let ast = Parser::new(pattern).parse()?;
        let mut prog = Vec::new();
        compile_node(&ast, &mut prog);
        prog.push(Inst::Match);
        Ok(Self { pattern: pattern.to_owned(), prog })
    }

    /// The literal pattern this was compiled from.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Streaming first-match search.
    ///
    /// Pulls runes from `src` one at a time and commits at the first
    /// position where any match completes, returning `(start, end)` byte
    /// offsets relative to the search origin. Source errors (timeout,
    /// end-of-stream) propagate unchanged. On success, exactly the runes up
    /// to `end` have been consumed from the source: nothing further.
    pub fn search_stream(&self, src: &mut dyn RuneSource) -> io::Result<(usize, usize)> {
        let n = self.prog.len();
        let mut clist: Vec<Thread> = Vec::with_capacity(n);
        let mut nlist: Vec<Thread> = Vec::with_capacity(n);
        let mut seen = vec![false; n];
        let mut pos = 0usize; // byte offset from the search origin

        loop {
            // Seed a fresh root thread at the current position so the search
            // is unanchored ('^' instructions veto origins past zero).
            seen.iter_mut().for_each(|s| *s = false);
            for t in nlist.drain(..) {
                add_thread(&self.prog, &mut clist, &mut seen, t.pc, t.start, pos);
            }
            add_thread(&self.prog, &mut clist, &mut seen, 0, pos, pos);

            // Commit before pulling more input: the earliest-completing
            // thread with the leftmost start wins, and no further rune is
            // ever read past that decision.
            if let Some(start) = clist
                .iter()
                .filter(|t| matches!(self.prog[t.pc], Inst::Match))
                .map(|t| t.start)
                .min()
            {
                clist.clear();
                return Ok((start, pos));
            }

            let ch = src.next_rune()?;
            let width = ch.len_utf8();

            for t in clist.drain(..) {
                let advances = match &self.prog[t.pc] {
                    Inst::Rune(r) => *r == ch,
                    Inst::AnyRune => ch != '\n',
                    Inst::Class { ranges, negated } => class_matches(ranges, *negated, ch),
                    _ => false,
                };
                if advances {
                    nlist.push(Thread { pc: t.pc + 1, start: t.start });
                }
            }
            pos += width;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Thread {
    pc: usize,
    start: usize,
}

fn class_matches(ranges: &[(char, char)], negated: bool, ch: char) -> bool {
    let inside = ranges.iter().any(|&(lo, hi)| lo <= ch && ch <= hi);
    inside != negated
}

/// Add `pc` to the thread list, following epsilon transitions.
fn add_thread(
    prog: &[Inst],
    list: &mut Vec<Thread>,
    seen: &mut [bool],
    pc: usize,
    start: usize,
    pos: usize,
) {
    if seen[pc] {
        return;
    }
    seen[pc] = true;
    match prog[pc] {
        Inst::Jump(to) => add_thread(prog, list, seen, to, start, pos),
        Inst::Split(a, b) => {
            add_thread(prog, list, seen, a, start, pos);
            add_thread(prog, list, seen, b, start, pos);
        }
        Inst::Begin => {
            if start == 0 {
                add_thread(prog, list, seen, pc + 1, start, pos);
            }
        }
        _ => list.push(Thread { pc, start }),
    }
}

fn compile_node(ast: &Ast, prog: &mut Vec<Inst>) {
    match ast {
        Ast::Empty => {}
        Ast::Literal(c) => prog.push(Inst::Rune(*c)),
        Ast::AnyRune => prog.push(Inst::AnyRune),
        Ast::Class { ranges, negated } => prog.push(Inst::Class {
            ranges: ranges.clone(),
            negated: *negated,
        }),
        Ast::Begin => prog.push(Inst::Begin),
        Ast::Concat(parts) => {
            for p in parts {
                compile_node(p, prog);
            }
        }
        Ast::Alternate(branches) => {
            // Chain of Splits; each branch ends with a Jump to the common exit.
            let mut jump_sites = Vec::new();
            let last = branches.len() - 1;
            for (i, b) in branches.iter().enumerate() {
                if i < last {
                    let split_at = prog.len();
                    prog.push(Inst::Split(0, 0)); // patched below
                    let branch_start = prog.len();
                    compile_node(b, prog);
                    jump_sites.push(prog.len());
                    prog.push(Inst::Jump(0)); // patched below
                    let next_branch = prog.len();
                    prog[split_at] = Inst::Split(branch_start, next_branch);
                } else {
                    compile_node(b, prog);
                }
            }
            let exit = prog.len();
            for site in jump_sites {
                prog[site] = Inst::Jump(exit);
            }
        }
        Ast::Star(node) => {
            let split_at = prog.len();
            prog.push(Inst::Split(0, 0));
            let body = prog.len();
            compile_node(node, prog);
            prog.push(Inst::Jump(split_at));
            let exit = prog.len();
            prog[split_at] = Inst::Split(body, exit);
        }
        Ast::Plus(node) => {
            let body = prog.len();
            compile_node(node, prog);
            let split_at = prog.len();
            prog.push(Inst::Split(0, 0));
            prog[split_at] = Inst::Split(body, split_at + 1);
        }
        Ast::Quest(node) => {
            let split_at = prog.len();
            prog.push(Inst::Split(0, 0));
            let body = prog.len();
            compile_node(node, prog);
            let exit = prog.len();
            prog[split_at] = Inst::Split(body, exit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test source over a fixed string that counts how many runes were
    /// pulled: the lookahead assertions depend on it.
    struct Counted {
        chars: Vec<char>,
        next: usize,
    }

    impl Counted {
        fn new(s: &str) -> Self {
            Self { chars: s.chars().collect(), next: 0 }
        }

        fn consumed_bytes(&self) -> usize {
            self.chars[..self.next].iter().map(|c| c.len_utf8()).sum()
        }
    }

    impl RuneSource for Counted {
        fn next_rune(&mut self) -> io::Result<char> {
            match self.chars.get(self.next) {
                Some(&c) => {
                    self.next += 1;
                    Ok(c)
                }
                None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "end of input")),
            }
        }
    }

    fn search(pattern: &str, input: &str) -> io::Result<(usize, usize)> {
        Regex::compile(pattern).unwrap().search_stream(&mut Counted::new(input))
    }

    #[test]
    fn leftmost_first_commits_to_earliest_completion() {
        // "a|ab" over "xaby" must yield "a", not "ab".
        let (lo, hi) = search("a|ab", "xaby").unwrap();
        assert_eq!((lo, hi), (1, 2));
        // Same with the branches swapped: earliest completion still wins.
        let (lo, hi) = search("ab|a", "xaby").unwrap();
        assert_eq!((lo, hi), (1, 2));
    }

    #[test]
    fn search_stops_pulling_at_the_match() {
        let re = Regex::compile("b+").unwrap();
        let mut src = Counted::new("abbbc");
        let (lo, hi) = re.search_stream(&mut src).unwrap();
        // First completion is the single 'b' at offset 1.
        assert_eq!((lo, hi), (1, 2));
        // Exactly "ab" pulled: nothing past the committed match.
        assert_eq!(src.consumed_bytes(), 2);
    }

    #[test]
    fn literal_and_dot() {
        assert_eq!(search("l.gin", "try login: ").unwrap(), (4, 9));
        // '.' does not cross a newline.
        assert!(search("a.b", "a\nb").is_err());
    }

    #[test]
    fn classes_and_ranges() {
        assert_eq!(search("[0-9]+", "port 443x").unwrap(), (5, 6));
        assert_eq!(search("[^ ]ord", "pass word").unwrap(), (5, 9));
        assert_eq!(search(r"\w+@", "  user@host").unwrap(), (2, 7));
    }

    #[test]
    fn alternation_and_groups() {
        assert_eq!(search("(yes|no)\\?", "reply yes? ").unwrap(), (6, 10));
        assert_eq!(search("(ab)+c", "xababc").unwrap(), (1, 6));
    }

    #[test]
    fn star_and_quest() {
        // "x*" matches empty at the origin without pulling any input.
        let re = Regex::compile("x*").unwrap();
        let mut src = Counted::new("yyy");
        assert_eq!(re.search_stream(&mut src).unwrap(), (0, 0));
        assert_eq!(src.consumed_bytes(), 0);

        assert_eq!(search("ab?c", "xacx").unwrap(), (1, 3));
    }

    #[test]
    fn begin_anchor_pins_search_origin() {
        assert_eq!(search("^ab", "abc").unwrap(), (0, 2));
        // Anchored pattern never matches later in the stream; the source
        // runs dry and its error comes back unchanged.
        let err = search("^b", "ab").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn multibyte_offsets_are_byte_accurate() {
        let (lo, hi) = search("λx", "αβλxγ").unwrap();
        // α and β are 2 bytes each; λx spans bytes 4..7.
        assert_eq!((lo, hi), (4, 7));
    }

    #[test]
    fn compile_errors() {
        assert!(Regex::compile("a(b").is_err());
        assert!(Regex::compile("a)b").is_err());
        assert!(Regex::compile("[z-a]").is_err());
        assert!(Regex::compile("[").is_err());
        assert!(Regex::compile("*a").is_err());
        assert!(Regex::compile("a{2,3}").is_err());
        assert!(Regex::compile("end$").is_err());
        assert!(Regex::compile("\\q").is_err());
        assert!(Regex::compile("a\\").is_err());
    }

    #[test]
    fn class_with_escapes_and_literal_dash() {
        assert_eq!(search(r"[\d-]+", "id 12-34 ").unwrap(), (3, 4));
        assert_eq!(search("[a-c-]+", "x-ab-z").unwrap(), (1, 2));
    }

    #[test]
    fn source_error_passes_through_unchanged() {
        struct Timing;
        impl RuneSource for Timing {
            fn next_rune(&mut self) -> io::Result<char> {
                Err(io::Error::new(io::ErrorKind::TimedOut, "no data within readiness bound"))
            }
        }
        let re = Regex::compile("never").unwrap();
        let err = re.search_stream(&mut Timing).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
