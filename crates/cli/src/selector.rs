// Provider/model choice when nothing was preselected.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Write};

use relay_catalog::{Model, ProviderEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice {
    /// Provider key or model id. Validated by the orchestrator.
    Picked(String),
    Cancelled,
}

/// Seam for the interactive menu.
pub trait Selector: Send {
    fn choose_provider(&mut self, providers: &[ProviderEntry]) -> io::Result<Choice>;
    fn choose_model(&mut self, provider: &ProviderEntry, models: &[Model]) -> io::Result<Choice>;
}

/// Numbered prompt on a reader/writer pair (stdin/stderr in the binary).
///
/// An empty line, `q` or end of input cancels. A number picks from the list;
/// anything else is passed through as a key or id.
pub struct PromptSelector<R, W> {
    input: R,
    output: W,
}

impl PromptSelector<BufReader<io::Stdin>, io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stderr())
    }
}

impl<R: BufRead, W: Write> PromptSelector<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, title: &str, entries: &[(String, String)]) -> io::Result<Choice> {
        writeln!(self.output, "{}", title)?;
        for (index, (_, label)) in entries.iter().enumerate() {
            writeln!(self.output, "  {:>2}) {}", index + 1, label)?;
        }
        write!(self.output, "Select [1-{}, q to cancel]: ", entries.len())?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(Choice::Cancelled);
        }
        let answer = line.trim();
        if answer.is_empty() || answer.eq_ignore_ascii_case("q") {
            return Ok(Choice::Cancelled);
        }

        match answer.parse::<usize>() {
            Ok(n) if (1..=entries.len()).contains(&n) => Ok(Choice::Picked(entries[n - 1].0.clone())),
            _ => Ok(Choice::Picked(answer.to_string())),
        }
    }
}

impl<R: BufRead + Send, W: Write + Send> Selector for PromptSelector<R, W> {
    fn choose_provider(&mut self, providers: &[ProviderEntry]) -> io::Result<Choice> {
        let entries: Vec<_> = providers
            .iter()
            .map(|p| {
                (
                    p.key.clone(),
                    format!("{} ({} models)", p.display_name, p.models.len()),
                )
            })
            .collect();
        self.ask("Choose a provider:", &entries)
    }

    fn choose_model(&mut self, provider: &ProviderEntry, models: &[Model]) -> io::Result<Choice> {
        let entries: Vec<_> = models
            .iter()
            .map(|m| {
                let label = if m.display_name == m.id {
                    m.id.clone()
                } else {
                    format!("{} [{}]", m.display_name, m.id)
                };
                (m.id.clone(), label)
            })
            .collect();
        self.ask(&format!("Choose a {} model:", provider.display_name), &entries)
    }
}

/// Replays predetermined answers; `Cancelled` once exhausted.
#[derive(Debug, Default)]
pub struct ScriptedSelector {
    providers: VecDeque<Choice>,
    models: VecDeque<Choice>,
    pub provider_prompts: usize,
    pub model_prompts: usize,
}

impl ScriptedSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(mut self, choice: Choice) -> Self {
        self.providers.push_back(choice);
        self
    }

    pub fn model(mut self, choice: Choice) -> Self {
        self.models.push_back(choice);
        self
    }
}

impl Selector for ScriptedSelector {
    fn choose_provider(&mut self, _providers: &[ProviderEntry]) -> io::Result<Choice> {
        self.provider_prompts += 1;
        Ok(self.providers.pop_front().unwrap_or(Choice::Cancelled))
    }

    fn choose_model(&mut self, _provider: &ProviderEntry, _models: &[Model]) -> io::Result<Choice> {
        self.model_prompts += 1;
        Ok(self.models.pop_front().unwrap_or(Choice::Cancelled))
    }
}
