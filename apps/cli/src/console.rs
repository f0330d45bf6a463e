//! Line-oriented MDB console.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use mdb_core::{Bus, Packet};

pub const HELP: &str = "\
syntax: commands separated by whitespace
- reset    MDB bus reset (TX high for 200ms, wait for 500ms)
- sN       pause N milliseconds
- @XX...   transmit MDB block from hex, show response
- loop=N   repeat the whole line N times
- help     show this text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Word {
    Help,
    Reset,
    Sleep(Duration),
    Tx(Packet),
}

/// A parsed input line: its words and how many times to run them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub words: Vec<Word>,
    pub repeat: usize,
}

pub fn parse_line(line: &str) -> Result<Line> {
    let mut words = Vec::new();
    let mut repeat = 1;
    for w in line.split_whitespace() {
        if let Some(n) = w.strip_prefix("loop=") {
            repeat = n.parse().with_context(|| format!("invalid loop count {w:?}"))?;
        } else if let Some(hex) = w.strip_prefix('@') {
            words.push(Word::Tx(Packet::from_hex(hex, true)?));
        } else if let Some(ms) = w.strip_prefix('s').filter(|s| !s.is_empty()) {
            let ms: u64 = ms.parse().with_context(|| format!("invalid pause {w:?}"))?;
            words.push(Word::Sleep(Duration::from_millis(ms)));
        } else {
            match w {
                "help" => words.push(Word::Help),
                "reset" => words.push(Word::Reset),
                _ => bail!("unknown command {w:?}, try help"),
            }
        }
    }
    Ok(Line { words, repeat })
}

pub struct Console<'a> {
    bus: &'a Bus,
}

impl<'a> Console<'a> {
    pub fn new(bus: &'a Bus) -> Self {
        Self { bus }
    }

    /// Run one input line. Transaction failures are reported and do not
    /// stop the line.
    pub fn run_line(&self, input: &str) -> Result<()> {
        let line = parse_line(input)?;
        for _ in 0..line.repeat {
            for word in &line.words {
                self.run_word(word)?;
            }
        }
        Ok(())
    }

    fn run_word(&self, word: &Word) -> Result<()> {
        match word {
            Word::Help => println!("{HELP}"),
            Word::Reset => self.bus.reset_default()?,
            Word::Sleep(d) => thread::sleep(*d),
            Word::Tx(request) => {
                let mut response = Packet::new();
                match self.bus.tx(request, &mut response) {
                    Ok(()) => println!("> {}\n< {}", request.format(), response.format()),
                    Err(e) => println!("> {}\n< error: {e}", request.format()),
                }
            }
        }
        Ok(())
    }
}
