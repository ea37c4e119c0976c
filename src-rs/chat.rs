use crate::generator::{assistant_system_prompt, Role, TextGenerator, Turn};

pub const OPENING_FAILURE: &str = "I'm sorry, I couldn't generate a response. Please try again later.";
pub const REPLY_FAILURE: &str = "I'm sorry, I encountered an error. Please try again later.";

const GENERAL_SYSTEM_PROMPT: &str = "You are a helpful assistant specializing in rice cultivation. \
Provide accurate, helpful information about rice plant diseases, including symptoms, treatment, and prevention methods. \
Be concise but informative. Only respond to prompts related to rice plants.";

/// Transcript of user and assistant turns. The system prompt is rebuilt from
/// the category on every request and never stored.
#[derive(Debug, Clone, Default)]
pub struct ChatSession {
    category: Option<String>,
    messages: Vec<Turn>,
}

impl ChatSession {
    pub fn new(category: Option<String>) -> Self {
        Self {
            category: category.filter(|c| !c.trim().is_empty()),
            messages: Vec::new(),
        }
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn messages(&self) -> &[Turn] {
        &self.messages
    }

    fn system_turn(&self) -> Turn {
        match &self.category {
            Some(category) => Turn::system(assistant_system_prompt(category)),
            None => Turn::system(GENERAL_SYSTEM_PROMPT),
        }
    }

    fn push_reply(&mut self, generator: &dyn TextGenerator, turns: &[Turn], fallback: &str) -> &Turn {
        let reply = match generator.generate(turns) {
            Ok(text) => text.trim().to_string(),
            Err(err) => {
                log::warn!("chat generation failed: {err}");
                fallback.to_string()
            }
        };
        self.messages.push(Turn::assistant(reply));
        &self.messages[self.messages.len() - 1]
    }

    /// Ask for the opening answer. Only the reply joins the transcript.
    pub fn start(&mut self, generator: &dyn TextGenerator) -> &Turn {
        let opening = match &self.category {
            Some(category) => format!("Tell me about {category} in rice plants."),
            None => "Tell me about common diseases in rice plants.".to_string(),
        };
        let turns = [self.system_turn(), Turn::user(opening)];
        self.push_reply(generator, &turns, OPENING_FAILURE)
    }

    /// Send a user message with the full history. Blank input is ignored.
    pub fn send(&mut self, generator: &dyn TextGenerator, text: &str) -> Option<&Turn> {
        if text.trim().is_empty() {
            return None;
        }
        self.messages.push(Turn::user(text));
        let mut turns = Vec::with_capacity(self.messages.len() + 1);
        turns.push(self.system_turn());
        turns.extend(self.messages.iter().filter(|t| t.role != Role::System).cloned());
        Some(self.push_reply(generator, &turns, REPLY_FAILURE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use std::sync::Mutex;

    /// Records every request and replies with the number of turns it saw.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Vec<Turn>>>,
        fail: bool,
    }

    impl TextGenerator for Recorder {
        fn generate(&self, turns: &[Turn]) -> Result<String, GenerationError> {
            self.seen.lock().unwrap().push(turns.to_vec());
            if self.fail {
                Err(GenerationError::EmptyResponse)
            } else {
                Ok(format!("  reply to {} turns \n", turns.len()))
            }
        }
    }

    #[test]
    fn start_asks_about_the_category() {
        let generator = Recorder::default();
        let mut session = ChatSession::new(Some("Tungro".into()));
        let opening = session.start(&generator).clone();
        assert_eq!(opening, Turn::assistant("reply to 2 turns"));

        let seen = generator.seen.lock().unwrap();
        assert_eq!(seen[0][0].role, Role::System);
        assert!(seen[0][0].content.contains("Tungro"));
        assert_eq!(seen[0][1], Turn::user("Tell me about Tungro in rice plants."));
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn send_carries_history() {
        let generator = Recorder::default();
        let mut session = ChatSession::new(Some("Brown_Spot".into()));
        session.start(&generator);
        session.send(&generator, "How fast does it spread?");
        session.send(&generator, "And in wet seasons?");

        let seen = generator.seen.lock().unwrap();
        let last = seen.last().unwrap();
        // system + opening reply + user + reply + user
        assert_eq!(last.len(), 5);
        assert_eq!(last[0].role, Role::System);
        assert_eq!(last[4], Turn::user("And in wet seasons?"));
        assert_eq!(session.messages().len(), 5);
    }

    #[test]
    fn blank_input_is_ignored() {
        let generator = Recorder::default();
        let mut session = ChatSession::new(None);
        assert!(session.send(&generator, "   \n").is_none());
        assert!(session.messages().is_empty());
        assert!(generator.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn failures_append_apologies() {
        let generator = Recorder {
            fail: true,
            ..Recorder::default()
        };
        let mut session = ChatSession::new(Some("Tungro".into()));
        assert_eq!(session.start(&generator).content, OPENING_FAILURE);
        let reply = session.send(&generator, "hello").unwrap();
        assert_eq!(reply.content, REPLY_FAILURE);
        assert_eq!(session.messages()[1], Turn::user("hello"));
    }
}
