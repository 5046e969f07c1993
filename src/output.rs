//! Multiplexed, line-oriented output.
//!
//! Every supervised process (and the supervisor itself) writes into its own
//! [`NameWriter`]. Writers buffer bytes until a newline arrives, then emit the
//! complete line to the shared destination prefixed with the writer's name,
//! padded to the widest registered name and followed by `" | "`:
//!
//! ```text
//! web    | listening on :8080
//! worker | picked up job 12
//! ```
//!
//! A trailing partial line stays buffered until a later write completes it;
//! dropping the writer discards it.

use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex, PoisonError};

use owo_colors::{OwoColorize, Style};
use strip_ansi_escapes::strip;

/// Category10 (d3) foreground colors, assigned to names in registration order.
const PALETTE: [(u8, u8, u8); 10] = [
    (0x1f, 0x77, 0xb4),
    (0xff, 0x7f, 0x0e),
    (0x2c, 0xa0, 0x2c),
    (0xd6, 0x27, 0x28),
    (0x94, 0x67, 0xbd),
    (0x8c, 0x56, 0x4b),
    (0xe3, 0x77, 0xc2),
    (0x7f, 0x7f, 0x7f),
    (0xbc, 0xbd, 0x22),
    (0x17, 0xbe, 0xcf),
];

const SEPARATOR: &str = " | ";

/// Options controlling how lines are decorated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputOptions {
    /// Colorize the name prefix.
    pub color: bool,
    /// Remove ANSI escape sequences from the line contents.
    pub strip_ansi: bool,
}

impl OutputOptions {
    /// Colors when stdout is a terminal and `NO_COLOR` is not set.
    pub fn detect() -> Self {
        let no_color = std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty());
        Self {
            color: io::stdout().is_terminal() && !no_color,
            strip_ansi: false,
        }
    }
}

/// Fan-in writer shared by all named sources.
#[derive(Clone)]
pub struct MuxWriter {
    shared: Arc<Mutex<Shared>>,
}

struct Shared {
    dst: Box<dyn Write + Send>,
    options: OutputOptions,
    width: usize,
    styles: HashMap<String, usize>,
}

impl MuxWriter {
    /// Creates a writer emitting to `dst`.
    pub fn new(dst: impl Write + Send + 'static, options: OutputOptions) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                dst: Box::new(dst),
                options,
                width: 0,
                styles: HashMap::new(),
            })),
        }
    }

    /// Creates a writer emitting to the process's stdout.
    pub fn stdout(options: OutputOptions) -> Self {
        Self::new(io::stdout(), options)
    }

    /// Registers `name`, returning the current prefix width and its style.
    ///
    /// The width only ever grows. A name keeps the style it was first given.
    pub fn register_name(&self, name: &str) -> (usize, Style) {
        let mut shared = self.lock();
        let (width, index) = shared.register(name);
        (width, palette_style(index))
    }

    /// Returns a sink whose lines are prefixed with `name`.
    pub fn writer(&self, name: &str) -> NameWriter {
        self.register_name(name);
        NameWriter {
            mux: self.clone(),
            name: name.to_string(),
            pending: Vec::new(),
        }
    }

    /// Writes a single message line under `name`.
    pub fn log(&self, name: &str, message: impl std::fmt::Display) {
        let mut writer = self.writer(name);
        // Output is best effort; a closed stdout must not take the supervisor down.
        let _ = writeln!(writer, "{}", message);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, name: &str, line: &[u8]) -> io::Result<()> {
        let mut shared = self.lock();
        let (width, index) = shared.register(name);
        let padded = format!("{:<width$}{}", name, SEPARATOR, width = width);
        let prefix = if shared.options.color {
            padded.style(palette_style(index)).to_string()
        } else {
            padded
        };

        let mut out = Vec::with_capacity(prefix.len() + line.len());
        out.extend_from_slice(prefix.as_bytes());
        if shared.options.strip_ansi {
            out.extend_from_slice(&strip(line));
        } else {
            out.extend_from_slice(line);
        }
        shared.dst.write_all(&out)?;
        shared.dst.flush()
    }
}

impl Shared {
    fn register(&mut self, name: &str) -> (usize, usize) {
        self.width = self.width.max(name.chars().count());
        let next = self.styles.len();
        let index = *self.styles.entry(name.to_string()).or_insert(next);
        (self.width, index)
    }
}

fn palette_style(index: usize) -> Style {
    let (r, g, b) = PALETTE[index % PALETTE.len()];
    Style::new().truecolor(r, g, b)
}

/// Byte sink for one named source.
pub struct NameWriter {
    mux: MuxWriter,
    name: String,
    pending: Vec<u8>,
}

impl NameWriter {
    /// The name this writer prefixes its lines with.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Write for NameWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (line, tail) = rest.split_at(pos + 1);
            self.pending.extend_from_slice(line);
            let result = self.mux.emit(&self.name, &self.pending);
            self.pending.clear();
            result?;
            rest = tail;
        }
        self.pending.extend_from_slice(rest);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Partial lines are never forced out.
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write target that can be inspected after the writer is done.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
        }

        pub(crate) fn lines(&self) -> Vec<String> {
            self.contents().lines().map(str::to_string).collect()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const PLAIN: OutputOptions = OutputOptions {
        color: false,
        strip_ansi: false,
    };

    #[test]
    fn lines_are_prefixed_and_partial_lines_wait() {
        let buf = SharedBuf::default();
        let mux = MuxWriter::new(buf.clone(), PLAIN);

        let mut a = mux.writer("a");
        a.write_all(b"bc\ndef").unwrap();
        assert_eq!(buf.lines(), vec!["a | bc"]);
        a.write_all(b"ghi\n").unwrap();

        let mut ab = mux.writer("ab");
        ab.write_all(b"jkl\nmno\n").unwrap();

        a.write_all(b"pqr\n").unwrap();

        assert_eq!(
            buf.lines(),
            vec!["a | bc", "a | defghi", "ab | jkl", "ab | mno", "a  | pqr"]
        );
    }

    #[test]
    fn data_without_newline_is_never_flushed() {
        let buf = SharedBuf::default();
        let mux = MuxWriter::new(buf.clone(), PLAIN);
        let mut w = mux.writer("web");
        w.write_all(b"no newline yet").unwrap();
        w.flush().unwrap();
        drop(w);
        assert_eq!(buf.contents(), "");
    }

    #[test]
    fn registration_is_idempotent() {
        let mux = MuxWriter::new(SharedBuf::default(), PLAIN);
        let (w1, s1) = mux.register_name("web");
        let (_, other) = mux.register_name("worker");
        let (w2, s2) = mux.register_name("web");
        assert_eq!(w1, 3);
        assert_eq!(w2, 6);
        assert_eq!(format!("{:?}", s1), format!("{:?}", s2));
        assert_ne!(format!("{:?}", s1), format!("{:?}", other));
    }

    #[test]
    fn colored_prefix_contains_escape_codes() {
        let buf = SharedBuf::default();
        let options = OutputOptions {
            color: true,
            strip_ansi: false,
        };
        let mux = MuxWriter::new(buf.clone(), options);
        mux.log("web", "hello");
        let out = buf.contents();
        assert!(out.contains("\u{1b}["), "{:?}", out);
        assert!(out.ends_with("hello\n"));
    }

    #[test]
    fn strip_ansi_cleans_line_contents() {
        let buf = SharedBuf::default();
        let options = OutputOptions {
            color: false,
            strip_ansi: true,
        };
        let mux = MuxWriter::new(buf.clone(), options);
        mux.writer("web")
            .write_all(b"\x1b[32mready\x1b[0m\n")
            .unwrap();
        assert_eq!(buf.lines(), vec!["web | ready"]);
    }

    #[test]
    fn concurrent_writers_never_interleave_lines() {
        let buf = SharedBuf::default();
        let mux = MuxWriter::new(buf.clone(), PLAIN);
        let names = ["n0", "n1", "n2", "n3"];
        for name in names {
            mux.register_name(name);
        }

        let threads: Vec<_> = names
            .iter()
            .map(|name| {
                let mut writer = mux.writer(name);
                let name = name.to_string();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        // Split each line across two writes.
                        write!(writer, "{}-{}-", name, i).unwrap();
                        writeln!(writer, "end").unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let lines = buf.lines();
        assert_eq!(lines.len(), 800);
        for line in lines {
            let (prefix, body) = line.split_once(" | ").unwrap();
            assert!(body.starts_with(prefix), "{}", line);
            assert!(body.ends_with("-end"), "{}", line);
        }
    }
}
