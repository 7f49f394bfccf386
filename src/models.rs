//! Platform independent view of the messages the bot receives.

/// Raw platform identity of a user.
pub type UserId = u64;

#[derive(Debug)]
pub enum Event {
    /// `ping` in any channel.
    Ping(Message),
    /// An admin command addressed to the bot in a guild channel.
    Command(Command, Message),
    /// Any other direct message, either a dialog answer or a pass.
    Direct(Message),
    Shutdown,
}

/// Commands understood in public channels, when the bot is mentioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Setup,
    Update,
    Status,
    Instructions,
}

impl Command {
    /// Find the command in a message that mentions the bot. Mass mentions never count as
    /// addressing the bot.
    pub fn parse(content: &str) -> Option<Self> {
        if content.contains("@everyone") || content.contains("@here") {
            return None;
        }

        let lower = content.to_lowercase();
        if lower.contains("!setup") {
            Some(Self::Setup)
        } else if lower.contains("!status") {
            Some(Self::Status)
        } else if lower.contains("!instruction") {
            Some(Self::Instructions)
        } else if lower.contains("!update") {
            Some(Self::Update)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub channel_id: u64,
    pub message_id: u64,
    pub author: Author,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Name of the guild the message was posted in, `None` for direct messages.
    pub guild: Option<String>,
    /// Whether the author may configure events in [`Self::guild`].
    pub is_admin: bool,
}

impl Message {
    pub fn reference(&self) -> MessageRef {
        MessageRef {
            channel_id: self.channel_id,
            message_id: self.message_id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Author {
    pub id: UserId,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
}

/// Points at a single message, to reply or react to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageRef {
    pub channel_id: u64,
    pub message_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commands() {
        assert_eq!(Some(Command::Setup), Command::parse("<@1> !SETUP please"));
        assert_eq!(Some(Command::Update), Command::parse("<@1> !update"));
        assert_eq!(Some(Command::Status), Command::parse("<@1> !status"));
        assert_eq!(Some(Command::Instructions), Command::parse("<@1> !instructions"));
        assert_eq!(Some(Command::Instructions), Command::parse("<@1> !instruction"));
        assert_eq!(None, Command::parse("<@1> hello"));
    }

    #[test]
    fn mass_mentions_are_ignored() {
        assert_eq!(None, Command::parse("@everyone <@1> !setup"));
        assert_eq!(None, Command::parse("@here !status"));
    }
}
