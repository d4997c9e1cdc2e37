use clap::{Parser, Subcommand};

/// hitl: human-in-the-loop approval pipeline
#[derive(Parser)]
#[command(name = "hitl", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP surface and all three consumers in one process (default)
    Run {
        /// Port to bind
        #[arg(short, long, env = "HITL_PORT")]
        port: Option<u16>,
    },

    /// Run only the HTTP surface
    Serve {
        #[arg(short, long, env = "HITL_PORT")]
        port: Option<u16>,
    },

    /// Run only the approval materializer
    Materializer,

    /// Run only the action processor
    Actions,

    /// Run only the notification dispatcher
    Notifier,

    /// Apply database migrations and exit
    Migrate,

    /// Inspect approvals
    Approval {
        #[command(subcommand)]
        command: ApprovalCommands,
    },

    /// Manage approver delivery channels
    Channel {
        #[command(subcommand)]
        command: ChannelCommands,
    },
}

#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// List approvals assigned to an approver, newest first
    List {
        #[arg(short, long)]
        approver: String,
    },
    /// Show the current status of one approval
    Status { context_id: String },
    /// Print the audit trail of one approval
    Events { context_id: String },
}

#[derive(Subcommand)]
pub enum ChannelCommands {
    /// Create or replace an approver's channel configuration
    Set {
        username: String,
        #[arg(long)]
        webhook: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["hitl"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_channel_set_parses() {
        let cli = Cli::try_parse_from([
            "hitl", "channel", "set", "alice", "--email", "a@x.io,b@x.io",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Channel {
                command: ChannelCommands::Set { username, webhook, email },
            }) => {
                assert_eq!(username, "alice");
                assert!(webhook.is_none());
                assert_eq!(email.as_deref(), Some("a@x.io,b@x.io"));
            }
            _ => panic!("expected channel set"),
        }
    }
}
