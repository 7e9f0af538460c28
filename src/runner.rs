use crate::error::AtmarkError;
use crate::interp::Interpreter;
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;

/// A preprocessing action performed, in command-line order, before the
/// main document.
#[derive(Debug, Clone)]
pub enum Prep {
    /// Interpret a template file.
    Template(PathBuf),
    /// Define a variable: `var=expr`, or a bare `var` bound to nil.
    Define(String),
    /// Execute host statements.
    Execute(String),
    /// Execute a file of host statements.
    ExecuteFile(PathBuf),
}

/// Run the preprocessing actions.  Returns whether all succeeded; with
/// exit-on-error set, a failure terminates the process inside `wrap`.
pub fn preprocess(interp: &mut Interpreter, actions: &[Prep]) -> bool {
    for (index, action) in actions.iter().enumerate() {
        let ok = match action {
            Prep::Template(path) => {
                let path = path.clone();
                interp.wrap(move |i| {
                    let file = fs::File::open(&path).map_err(AtmarkError::io)?;
                    let mut reader = BufReader::new(file);
                    let name = path.display().to_string();
                    i.process_file(&mut reader, &name, None)
                })
            }
            Prep::Define(text) => {
                let prefix = interp.prefix();
                let code = if text.contains('=') {
                    format!("{}{{{}}}", prefix, text)
                } else {
                    format!("{}{{{} = nil}}", prefix, text)
                };
                let name = format!("<define:{}>", index);
                interp.wrap(move |i| i.process_string(&code, &name, None))
            }
            Prep::Execute(text) => {
                let prefix = interp.prefix();
                let code = format!("{}{{{}}}", prefix, text);
                let name = format!("<exec:{}>", index);
                interp.wrap(move |i| i.process_string(&code, &name, None))
            }
            Prep::ExecuteFile(path) => {
                let path = path.clone();
                interp.wrap(move |i| {
                    let contents = fs::read_to_string(&path).map_err(AtmarkError::io)?;
                    i.execute(&contents, None)
                })
            }
        };
        if !ok {
            return false;
        }
    }
    true
}

/// Process the main document: a named file, or stdin when no filename is
/// given.  A chunk size selects binary (byte-counted) processing.
pub fn process_document(
    interp: &mut Interpreter,
    filename: Option<&str>,
    binary: Option<usize>,
) -> bool {
    match filename {
        None => interp.wrap(|i| {
            let stdin = std::io::stdin();
            let mut lock = stdin.lock();
            i.process_file(&mut lock, "<stdin>", None)
        }),
        Some(filename) => {
            let name = filename.to_string();
            match binary {
                Some(chunk_size) => interp.wrap(move |i| {
                    let mut file = fs::File::open(&name).map_err(AtmarkError::io)?;
                    i.process_binary(&mut file, &name, chunk_size, None)
                }),
                None => interp.wrap(move |i| {
                    let file = fs::File::open(&name).map_err(AtmarkError::io)?;
                    let mut reader = BufReader::new(file);
                    i.process_file(&mut reader, &name, None)
                }),
            }
        }
    }
}
