pub mod progress;
pub mod shell;
pub mod slug;

pub fn stdout_is_pipe() -> bool {
    !atty::is(atty::Stream::Stdout)
}
