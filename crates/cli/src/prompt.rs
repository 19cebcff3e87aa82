use derive_more::{Display, Error};
use inquire::{Confirm, InquireError, Select, Text};

use crate::interrupt::Cancelled;

/// Interactive prompt errors.
#[derive(Debug, Display, Error)]
pub(crate) enum PromptError {
    /// User dismissed the prompt with Esc or Ctrl-C.
    Cancelled(Cancelled),

    #[display(fmt = "nothing to select from")]
    NoOptions,

    #[display(fmt = "unable to read answer: {}", _0)]
    Failed(InquireError),
}

impl From<InquireError> for PromptError {
    fn from(error: InquireError) -> Self {
        match error {
            InquireError::OperationCanceled | InquireError::OperationInterrupted => {
                PromptError::Cancelled(Cancelled)
            }
            error => PromptError::Failed(error),
        }
    }
}

/// Questions asked during interactive commands.
pub(crate) trait Prompter {
    /// Ask a yes/no question.
    fn confirm(&mut self, question: &str, default: bool) -> Result<bool, PromptError>;

    /// Ask for free-form text, falling back to `default` on an empty answer.
    fn input(&mut self, question: &str, default: Option<&str>) -> Result<String, PromptError>;

    /// Ask to pick one of `labels` and return its index.
    fn choose(&mut self, question: &str, labels: Vec<String>) -> Result<usize, PromptError>;
}

/// Ask to pick one of `options`, showing each of them with `label`.
pub(crate) fn select<'a, T, P>(
    prompter: &mut P,
    question: &str,
    options: &'a [T],
    label: impl Fn(&T) -> String,
) -> Result<&'a T, PromptError>
where
    P: Prompter + ?Sized,
{
    if options.is_empty() {
        return Err(PromptError::NoOptions);
    }

    let index = prompter.choose(question, options.iter().map(label).collect())?;

    options.get(index).ok_or(PromptError::NoOptions)
}

/// Prompts rendered on the terminal.
pub(crate) struct Terminal;

impl Prompter for Terminal {
    fn confirm(&mut self, question: &str, default: bool) -> Result<bool, PromptError> {
        Ok(Confirm::new(question).with_default(default).prompt()?)
    }

    fn input(&mut self, question: &str, default: Option<&str>) -> Result<String, PromptError> {
        let mut text = Text::new(question);

        if let Some(default) = default.filter(|default| !default.is_empty()) {
            text = text.with_default(default);
        }

        Ok(text.prompt()?.trim().to_owned())
    }

    fn choose(&mut self, question: &str, labels: Vec<String>) -> Result<usize, PromptError> {
        Ok(Select::new(question, labels).raw_prompt()?.index)
    }
}
