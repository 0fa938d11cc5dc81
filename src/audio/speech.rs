use super::{LocalSpeech, SpeechDone};
use std::process::{Command, Stdio};

/// Speaks through the platform's command-line synthesizer: `say` on macOS,
/// `espeak` elsewhere.
#[derive(Debug, Clone)]
pub struct SystemSpeech {
    program: String,
    args: Vec<String>,
}

impl SystemSpeech {
    pub fn new() -> Self {
        if cfg!(target_os = "macos") {
            Self::with_command("say", &[])
        } else {
            Self::with_command("espeak", &[])
        }
    }

    /// Use `program args... <text>`.
    pub fn with_command(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn command(&self, text: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl Default for SystemSpeech {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSpeech for SystemSpeech {
    fn speak(&mut self, text: &str, done: SpeechDone) {
        let mut cmd = self.command(text);
        let program = self.program.clone();
        std::thread::spawn(move || {
            let ok = match cmd.status() {
                Ok(status) => status.success(),
                Err(e) => {
                    log::warn!("[speech] failed to run {}: {}", program, e);
                    false
                }
            };
            done(ok);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn missing_program_reports_failure() {
        let mut speech = SystemSpeech::with_command("echoflow-no-such-speech-binary", &[]);
        let (tx, rx) = mpsc::channel();
        speech.speak("hello", Box::new(move |ok| tx.send(ok).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(false));
    }

    #[cfg(unix)]
    #[test]
    fn successful_command_reports_success() {
        let mut speech = SystemSpeech::with_command("true", &[]);
        let (tx, rx) = mpsc::channel();
        speech.speak("hello", Box::new(move |ok| tx.send(ok).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    }
}
