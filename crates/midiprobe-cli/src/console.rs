use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};

/// Line-oriented prompts on top of any buffered reader.
pub struct Console {
    input: Box<dyn BufRead>,
}

impl Console {
    pub fn stdin() -> Self {
        Self::new(Box::new(io::stdin().lock()))
    }

    pub fn new(input: Box<dyn BufRead>) -> Self {
        Self { input }
    }

    /// Print `prompt` and read lines until one parses as a number.
    pub fn prompt_number(&mut self, prompt: &str) -> Result<i64> {
        loop {
            print!("{prompt}");
            io::stdout().flush().context("failed to flush stdout")?;
            let line = self.read_line()?;
            if let Ok(value) = line.trim().parse() {
                return Ok(value);
            }
        }
    }

    /// Print `prompt` and block until a line is entered.
    pub fn wait_for_enter(&mut self, prompt: &str) -> Result<()> {
        print!("{prompt}");
        io::stdout().flush().context("failed to flush stdout")?;
        self.read_line().map(|_| ())
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("failed to read from console")?;
        if read == 0 {
            bail!("console input closed");
        }
        Ok(line)
    }
}
