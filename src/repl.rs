use crate::interp::Interpreter;
use std::io;

/// Interactive mode: stdin is processed as a template, expanding as
/// complete markup arrives.  When errors are suppressed the interpreter
/// resets its stacks and keeps accepting input; otherwise the first
/// failure ends the session.
pub fn start(interp: &mut Interpreter) {
    eprintln!("atmark interactive mode; Ctrl-D ends input");

    loop {
        let ok = interp.wrap(|i| {
            let stdin = io::stdin();
            let mut lock = stdin.lock();
            i.process_file(&mut lock, "<interact>", None)
        });
        if ok || interp.options().exit_on_error {
            break;
        }
    }
}
