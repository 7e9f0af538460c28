use atmark::evaluator::Bindings;
use atmark::interp::{Interpreter, Options, FAILURE_CODE};
use atmark::repl;
use atmark::runner::{self, Prep};
use atmark::stream::{FileSink, StdoutSink, TextSink};
use atmark::value::Value;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let matches = Command::new("atmark")
        .about("An embedded @-markup template processor")
        .arg(
            Arg::new("file")
                .help("The template file to process ('-' or nothing for stdin)")
                .value_name("FILE")
                .index(1),
        )
        .arg(
            Arg::new("args")
                .help("Arguments exposed to the template as 'argv'")
                .value_name("ARGS")
                .num_args(0..)
                .index(2),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Write output to this file"),
        )
        .arg(
            Arg::new("append")
                .short('a')
                .long("append")
                .value_name("FILE")
                .conflicts_with("output")
                .help("Append output to this file"),
        )
        .arg(
            Arg::new("buffered")
                .short('b')
                .long("buffered-output")
                .action(ArgAction::SetTrue)
                .help("Fully buffer output; commit on success, discard on failure"),
        )
        .arg(
            Arg::new("prefix")
                .short('p')
                .long("prefix")
                .value_name("CHAR")
                .default_value("@")
                .help("The markup prefix character"),
        )
        .arg(
            Arg::new("module")
                .short('m')
                .long("module")
                .value_name("NAME")
                .help("The name of the interpreter pseudo-module binding"),
        )
        .arg(
            Arg::new("suppress-errors")
                .short('k')
                .long("suppress-errors")
                .action(ArgAction::SetTrue)
                .help("Report errors but keep going interactively"),
        )
        .arg(
            Arg::new("raw-errors")
                .short('r')
                .long("raw-errors")
                .action(ArgAction::SetTrue)
                .help("Report errors undecorated, without the context backtrace"),
        )
        .arg(
            Arg::new("interactive")
                .short('i')
                .long("interactive")
                .action(ArgAction::SetTrue)
                .help("Go interactive after processing the main document"),
        )
        .arg(
            Arg::new("binary")
                .long("binary")
                .action(ArgAction::SetTrue)
                .help("Process the input in binary chunks, counting bytes"),
        )
        .arg(
            Arg::new("chunk-size")
                .long("chunk-size")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help("Chunk size for binary processing (implies --binary)"),
        )
        .arg(
            Arg::new("no-bangpath")
                .long("no-bangpath")
                .action(ArgAction::SetTrue)
                .help("Do not treat a leading '#!' line as a comment"),
        )
        .arg(
            Arg::new("preprocess")
                .short('P')
                .long("preprocess")
                .value_name("FILE")
                .action(ArgAction::Append)
                .help("Interpret a template file before the main document"),
        )
        .arg(
            Arg::new("define")
                .short('D')
                .long("define")
                .value_name("VAR[=EXPR]")
                .action(ArgAction::Append)
                .help("Define a variable before the main document"),
        )
        .arg(
            Arg::new("execute")
                .short('E')
                .long("execute")
                .value_name("STMTS")
                .action(ArgAction::Append)
                .help("Execute host statements before the main document"),
        )
        .arg(
            Arg::new("execute-file")
                .short('F')
                .long("execute-file")
                .value_name("FILE")
                .action(ArgAction::Append)
                .help("Execute a file of host statements before the main document"),
        )
        .get_matches();

    let prefix = match parse_prefix(&matches) {
        Ok(prefix) => prefix,
        Err(message) => die(&message),
    };

    let buffered = matches.get_flag("buffered");
    let output_path = matches.get_one::<String>("output").cloned();
    let append_path = matches.get_one::<String>("append").cloned();
    if buffered && output_path.is_none() && append_path.is_none() {
        die("-b only makes sense with -o or -a");
    }

    let output: Box<dyn TextSink> = match (output_path, append_path) {
        (Some(path), _) => match FileSink::new(PathBuf::from(path), false, buffered) {
            Ok(sink) => Box::new(sink),
            Err(error) => die(&error.to_string()),
        },
        (None, Some(path)) => match FileSink::new(PathBuf::from(path), true, buffered) {
            Ok(sink) => Box::new(sink),
            Err(error) => die(&error.to_string()),
        },
        (None, None) => Box::new(StdoutSink),
    };

    let suppress = matches.get_flag("suppress-errors");
    let options = Options {
        bangpath: !matches.get_flag("no-bangpath"),
        buffered,
        raw_errors: matches.get_flag("raw-errors"),
        exit_on_error: !suppress,
    };
    // Suppressing errors implies interactive continuation.
    let interactive = matches.get_flag("interactive") || suppress;

    let filename = matches
        .get_one::<String>("file")
        .filter(|name| name.as_str() != "-")
        .cloned();

    let binary = if let Some(size) = matches.get_one::<usize>("chunk-size") {
        Some(*size)
    } else if matches.get_flag("binary") {
        Some(0)
    } else {
        None
    };

    let mut globals = Bindings::new();
    let mut argv: Vec<Value> = Vec::new();
    argv.push(Value::String(
        filename.clone().unwrap_or_else(|| "-".to_string()),
    ));
    if let Some(args) = matches.get_many::<String>("args") {
        argv.extend(args.map(|arg| Value::String(arg.clone())));
    }
    globals.insert("argv".to_string(), Value::List(argv));

    let mut interp = match Interpreter::with_config(
        output,
        prefix,
        matches.get_one::<String>("module").cloned(),
        options,
        Some(globals),
    ) {
        Ok(interp) => interp,
        Err(error) => {
            error.report();
            std::process::exit(FAILURE_CODE);
        }
    };

    runner::preprocess(&mut interp, &gather_preps(&matches));

    if filename.is_some() || !interactive {
        runner::process_document(&mut interp, filename.as_deref(), binary);
    }

    if interactive {
        repl::start(&mut interp);
    }

    if let Err(error) = interp.shutdown() {
        error.report();
        std::process::exit(FAILURE_CODE);
    }
}

fn parse_prefix(matches: &ArgMatches) -> Result<char, String> {
    let prefix = matches
        .get_one::<String>("prefix")
        .map(String::as_str)
        .unwrap_or("@")
        .to_string();
    let mut chars = prefix.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err("prefix must be a single-character string".to_string()),
    }
}

/// Collect the preprocessing actions in their command-line order, merging
/// across the four flags.
fn gather_preps(matches: &ArgMatches) -> Vec<Prep> {
    let mut indexed: Vec<(usize, Prep)> = Vec::new();
    collect_preps(matches, "preprocess", &mut indexed, |value| {
        Prep::Template(PathBuf::from(value))
    });
    collect_preps(matches, "define", &mut indexed, |value| {
        Prep::Define(value.to_string())
    });
    collect_preps(matches, "execute", &mut indexed, |value| {
        Prep::Execute(value.to_string())
    });
    collect_preps(matches, "execute-file", &mut indexed, |value| {
        Prep::ExecuteFile(PathBuf::from(value))
    });
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, prep)| prep).collect()
}

fn collect_preps(
    matches: &ArgMatches,
    name: &str,
    into: &mut Vec<(usize, Prep)>,
    make: fn(&str) -> Prep,
) {
    if let (Some(values), Some(indices)) = (
        matches.get_many::<String>(name),
        matches.indices_of(name),
    ) {
        for (value, index) in values.zip(indices) {
            into.push((index, make(value)));
        }
    }
}

fn die(message: &str) -> ! {
    eprintln!("atmark: {}", message);
    std::process::exit(FAILURE_CODE);
}
