//! Binary entrypoint that launches the Gemini chat console.

use std::process::ExitCode;

use gemini_chat::start_gemini_chat;

/// Start the console with configuration taken from the environment.
fn main() -> ExitCode {
    start_gemini_chat::run()
}
