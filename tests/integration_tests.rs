// End-to-end expansion tests for the atmark template processor.
//
// Each test drives a full interpreter over a string or chunked source and
// checks the expanded output, the binding environment, or the failure
// kind.

use atmark::{
    AtmarkError, ErrorKind, FunctionStage, Interpreter, Options, Processor, StringSink,
    TranslateStage, Value,
};
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

fn build_interp() -> (Interpreter, Rc<RefCell<String>>) {
    let sink = StringSink::new();
    let handle = sink.handle();
    let options = Options {
        exit_on_error: false,
        ..Options::default()
    };
    let interp = Interpreter::with_config(Box::new(sink), '@', None, options, None)
        .expect("interpreter should build");
    (interp, handle)
}

fn expand(template: &str) -> Result<String, AtmarkError> {
    let (mut interp, handle) = build_interp();
    interp.process_string(template, "<test>", None)?;
    interp.shutdown()?;
    let output = handle.borrow().clone();
    Ok(output)
}

fn expand_chunked(template: &str, chunk_size: usize) -> Result<String, AtmarkError> {
    let (mut interp, handle) = build_interp();
    let mut source = Cursor::new(template.as_bytes().to_vec());
    interp.process_binary(&mut source, "<chunk>", chunk_size, None)?;
    interp.shutdown()?;
    let output = handle.borrow().clone();
    Ok(output)
}

#[track_caller]
fn expect(template: &str, expected: &str) {
    match expand(template) {
        Ok(output) => assert_eq!(output, expected, "template: {:?}", template),
        Err(error) => panic!("template {:?} failed: {}", template, error),
    }
}

#[track_caller]
fn expect_error(template: &str, kind: ErrorKind) {
    match expand(template) {
        Ok(output) => panic!(
            "template {:?} should have failed, produced {:?}",
            template, output
        ),
        Err(error) => assert_eq!(error.kind, kind, "template: {:?}: {}", template, error),
    }
}

// === PASSTHROUGH AND PREFIX ===

#[test]
fn plain_text_passes_through_byte_identical() {
    expect("", "");
    expect("hello, world\n", "hello, world\n");
    expect("no markup: % # ( ) [ ] { } ` : ! ?\n", "no markup: % # ( ) [ ] { } ` : ! ?\n");
    expect("unicode héllo wörld ✓\n", "unicode héllo wörld ✓\n");
}

#[test]
fn doubled_prefix_emits_one_literal_prefix() {
    expect("@@", "@");
    expect("user@@host", "user@host");
    expect("@@@@", "@@");
    expect("@@(not evaluated)", "@(not evaluated)");
}

#[test]
fn whitespace_markup_is_a_line_continuation() {
    expect("a@\nb", "ab");
    expect("a@ b", "ab");
}

#[test]
fn close_brackets_pass_through_literally() {
    expect("@)", ")");
    expect("@]", "]");
    expect("@}", "}");
}

#[test]
fn comments_are_discarded_through_the_newline() {
    expect("a@# this is a comment\nb", "ab");
    expect("@#only a comment\n", "");
}

// === ESCAPES ===

#[test]
fn single_letter_escapes_decode_to_exact_bytes() {
    expect("@\\n", "\n");
    expect("@\\t", "\t");
    expect("@\\r", "\r");
    expect("@\\0", "\0");
    expect("@\\a", "\x07");
    expect("@\\b", "\x08");
    expect("@\\e", "\x1b");
    expect("@\\f", "\x0c");
    expect("@\\h", "\x7f");
    expect("@\\v", "\x0b");
    expect("@\\z", "\x04");
    expect("@\\s", " ");
    expect("@\\\\", "\\");
    expect("@\\(", "(");
}

#[test]
fn numeric_escapes_decode_their_base() {
    expect("@\\x41", "A");
    expect("@\\d065", "A");
    expect("@\\o101", "A");
    expect("@\\q1001", "A");
    expect("@\\u00e9", "é");
    expect("@\\U0001f600", "\u{1f600}");
}

#[test]
fn control_escapes_decode() {
    expect("@\\^A", "\x01");
    expect("@\\^@", "\0");
    expect("@\\^?", "\x7f");
}

#[test]
fn malformed_escapes_are_hard_parse_errors() {
    expect_error("@\\xzz", ErrorKind::Parse);
    expect_error("@\\y", ErrorKind::Parse);
    expect_error("@\\^!", ErrorKind::Parse);
    // A surrogate is not a Unicode scalar value.
    expect_error("@\\ud800", ErrorKind::Parse);
    expect_error("@\\Uffffffff", ErrorKind::Parse);
}

// === EXPRESSION MARKUP ===

#[test]
fn expressions_evaluate_and_serialize() {
    expect("@(1 + 2)", "3");
    expect("@((1 + 2) * 3)", "9");
    expect("@(\"con\" + \"cat\")", "concat");
    expect("@(7 / 2)", "3.5");
    expect("@(nil)", "");
}

#[test]
fn conditional_expressions_branch_on_the_test() {
    expect("@(true ? \"yes\" ! \"no\")", "yes");
    expect("@(false ? \"yes\" ! \"no\")", "no");
    expect("@{f = false}@(f ? \"yes\")", "");
}

#[test]
fn secondary_delimiters_inside_quotes_are_not_split_points() {
    expect("@(\"a?b\" ? \"yes\" ! \"no\")", "yes");
    expect("@(\"x!y$z\" ? \"q?\" ! \"r\")", "q?");
}

#[test]
fn except_part_recovers_from_runtime_errors() {
    expect("@(1 / 0 $ \"safe\")", "safe");
    expect("@(undefined_name $ \"fallback\")", "fallback");
    expect("@(atmark.play_diversion(\"nope\") $ \"missing\")", "missing");
}

#[test]
fn except_part_never_catches_host_syntax_errors() {
    expect_error("@(1 + $ \"safe\")", ErrorKind::Syntax);
}

#[test]
fn runtime_errors_without_except_propagate() {
    expect_error("@(1 / 0)", ErrorKind::Runtime);
    expect_error("@(undefined_name)", ErrorKind::Runtime);
}

#[test]
fn simple_expression_markup_follows_dotted_chains() {
    expect("@{name = \"world\"}@name", "world");
    expect("@{name = \"world\"}@name.upper()", "WORLD");
    expect("@{xs = [1, 2, 3]}@len(xs)", "3");
    // A trailing dot belongs to the surrounding text.
    expect("@{x = 5}@x.", "5.");
}

#[test]
fn string_literal_markup_evaluates_the_literal() {
    expect("@\"hello\"", "hello");
    expect("@\"\"\"a\nb\"\"\"", "a\nb");
}

#[test]
fn repr_markup_always_writes_the_debug_form() {
    expect("@`nil`", "nil");
    expect("@`\"a\"`", "\"a\"");
    expect("@`[1, \"x\"]`", "[1, \"x\"]");
    expect("@`2.0`", "2.0");
}

#[test]
fn in_place_markup_keeps_the_original_visible() {
    expect("@:2 + 2::", "@:2 + 2:4:");
}

// === STATEMENTS AND THE HOST LANGUAGE ===

#[test]
fn statement_markup_executes_against_the_globals() {
    expect("@{x = 5}@x", "5");
    expect("@{x = 2}@{x = x * 10}@x", "20");
}

#[test]
fn prints_inside_statements_land_on_the_current_stream() {
    expect("@{print(\"hi\")}", "hi\n");
    expect("@{print(\"a\", 1)}", "a 1\n");
}

#[test]
fn multi_line_statements_run_as_programs() {
    expect("@{\nx = 0\nfor (i = 0; i < 4; i = i + 1) { x = x + i }\n}@x", "6");
    expect("@{\nif (1 < 2) { y = \"lt\" } else { y = \"ge\" }\n}@y", "lt");
}

#[test]
fn destructuring_assignment_unpacks_sequences() {
    expect("@{a, b = [1, 2]}@a@b", "12");
    expect("@{a, _, c = [1, 2, 3]}@a@c", "13");
}

#[test]
fn host_collections_support_indexing_and_methods() {
    expect("@{d = {\"k\": 1, \"j\": 2}}@(d[\"k\"])", "1");
    expect("@{d = {\"k\": 1}}@(d.get(\"missing\", 9))", "9");
    expect("@{xs = [10, 20, 30]}@(xs[1])@(xs[-1])", "2030");
    expect("@(\"a,b,c\".split(\",\")[1])", "b");
    expect("@(\"-\".join([\"x\", \"y\"]))", "x-y");
    expect("@(sorted([3, 1, 2]))", "[1, 2, 3]");
    expect("@(range(3))", "[0, 1, 2]");
}

#[test]
fn defined_builtin_consults_the_environment() {
    expect("@(defined(\"x\") ? \"y\" ! \"n\")", "n");
    expect("@{x = 1}@(defined(\"x\") ? \"y\" ! \"n\")", "y");
}

// === CONTROL MARKUP ===

#[test]
fn if_elif_else_selects_the_first_true_segment() {
    expect("@{x = 5}@[if x < 3]low@[elif x < 10]mid@[else]high@[end if]", "mid");
    expect("@{x = 1}@[if x < 3]low@[elif x < 10]mid@[else]high@[end if]", "low");
    expect("@{x = 50}@[if x < 3]low@[elif x < 10]mid@[else]high@[end if]", "high");
}

#[test]
fn nested_control_blocks_track_depth_recursively() {
    expect("@[if true]@[if false]X@[end if]Y@[end if]", "Y");
    expect("@[if false]@[if true]X@[end if]Y@[end if]Z", "Z");
}

#[test]
fn for_loops_iterate_and_bind() {
    expect("@[for x in [1, 2, 3]]@x@[end for]", "123");
    expect("@[for c in \"abc\"](@c)@[end for]", "(a)(b)(c)");
    expect("@[for (a, b) in [[1, 2], [3, 4]]]@a-@b;@[end for]", "1-2;3-4;");
    // Dictionaries iterate their keys in sorted order.
    expect("@[for k in {\"b\": 1, \"a\": 2}]@k@[end for]", "ab");
}

#[test]
fn continue_skips_to_the_next_element() {
    expect(
        "@[for x in [1, 2, 3]]@[if x == 2]@[continue]@[end if]@x@[end for]",
        "13",
    );
}

#[test]
fn break_exits_the_loop_and_suppresses_else() {
    expect(
        "@[for x in [1, 2, 3]]@[if x == 2]@[break]@[end if]@x@[end for]",
        "1",
    );
    expect(
        "@[for x in [1, 2, 3]]@[if x == 2]@[break]@[end if]@[else]NEVER@[end for]",
        "",
    );
}

#[test]
fn for_else_runs_when_the_loop_never_breaks() {
    expect("@[for x in [1, 2]]@x@[else]!@[end for]", "12!");
    // Zero iterations still count as completing without a break.
    expect("@[for x in []]X@[else]empty@[end for]", "empty");
}

#[test]
fn while_loops_reevaluate_their_condition() {
    expect("@{i = 0}@[while i < 3]@i@{i = i + 1}@[end while]", "012");
}

#[test]
fn while_else_runs_only_on_condition_false() {
    expect(
        "@{i = 0}@[while i < 2]@i@{i = i + 1}@[else]done@[end while]",
        "01done",
    );
    expect("@[while true]x@[break]@[else]NEVER@[end while]", "x");
}

#[test]
fn stray_flow_controls_are_hard_errors() {
    expect_error("@[break]", ErrorKind::Flow);
    expect_error("@[continue]", ErrorKind::Flow);
    expect_error("@[if true]@[break]@[end if]", ErrorKind::Flow);
}

#[test]
fn try_except_catches_runtime_errors() {
    expect("@[try]@(1 / 0)@[except]caught@[end try]", "caught");
    expect(
        "@[try]@(1 / 0)@[except runtime, e]<@e>@[end try]",
        "<Division by zero>",
    );
    expect(
        "@[try]ok@(1)@[except]never@[end try]",
        "ok1",
    );
}

#[test]
fn except_clauses_match_by_error_kind() {
    expect(
        "@[try]@{atmark.play_diversion(\"nope\")}@[except diversion]D@[end try]",
        "D",
    );
    // A mismatched kind re-raises.
    expect_error("@[try]@(1 / 0)@[except parse]P@[end try]", ErrorKind::Runtime);
}

#[test]
fn try_never_catches_host_syntax_errors() {
    expect_error("@[try]@(1 +)@[except]C@[end try]", ErrorKind::Syntax);
}

#[test]
fn try_finally_always_runs_the_final_segment() {
    expect("@[try]body@[finally]fin@[end try]", "bodyfin");
    expect_error("@[try]@(1 / 0)@[finally]F@[end try]", ErrorKind::Runtime);
}

#[test]
fn try_shape_is_validated() {
    expect_error("@[try]x@[end try]", ErrorKind::Parse);
    expect_error(
        "@[try]x@[except]y@[finally]z@[end try]",
        ErrorKind::Parse,
    );
}

#[test]
fn mismatched_terminators_are_parse_errors() {
    expect_error("@[if true]x@[end for]", ErrorKind::Parse);
    expect_error("@[end if]", ErrorKind::Parse);
    expect_error("@[frobnicate x]", ErrorKind::Parse);
}

// === MACROS ===

#[test]
fn def_markup_defines_a_callable_macro() {
    expect(
        "@[def greet(name)]Hello, @name!@[end def]@greet(\"World\")",
        "Hello, World!",
    );
    expect(
        "@[def twice(x)]@x@x@[end def]@twice(\"ab\")",
        "abab",
    );
}

#[test]
fn macro_bodies_reconstruct_nested_markup() {
    expect(
        "@[def shout(xs)]@[for x in xs]@x!@[end for]@[end def]@shout([1, 2])",
        "1!2!",
    );
}

#[test]
fn macro_arity_is_checked() {
    expect_error(
        "@[def pair(a, b)]@a@b@[end def]@pair(1)",
        ErrorKind::Runtime,
    );
}

// === SIGNIFICATORS ===

#[test]
fn significators_bind_reserved_names_with_evaluated_values() {
    let (mut interp, handle) = build_interp();
    interp
        .process_string("@%version 3\n@%author \"me\"\n@%flag\n", "<sig>", None)
        .expect("significators should process");
    assert_eq!(interp.globals().get("__version__"), Some(&Value::Int(3)));
    assert_eq!(
        interp.globals().get("__author__"),
        Some(&Value::String("me".to_string()))
    );
    assert_eq!(interp.globals().get("__flag__"), Some(&Value::Nil));
    // Significators produce no output.
    assert_eq!(handle.borrow().as_str(), "");
}

#[test]
fn malformed_significators_are_parse_errors() {
    expect_error("@% key value\n", ErrorKind::Parse);
}

// === CONTEXTS AND DIAGNOSTICS ===

#[test]
fn context_directives_rename_and_reposition() {
    expect("@?renamed\n@(atmark.identify()[0])", "renamed");
    expect("@!100\n@(atmark.identify()[1])", "100");
}

#[test]
fn errors_carry_the_context_stack() {
    let (mut interp, _handle) = build_interp();
    let error = interp
        .process_string("line one\n@(undefined_name)", "<bad>", None)
        .expect_err("expansion should fail");
    let decorated = interp.decorate(error);
    assert!(!decorated.frames.is_empty());
    assert_eq!(decorated.frames[0].name, "<bad>");
    assert_eq!(decorated.frames[0].line, 1);
}

#[test]
fn unterminated_markup_is_promoted_at_end_of_input() {
    expect_error("@(1 +", ErrorKind::Parse);
    expect_error("@[if true]unclosed", ErrorKind::Parse);
    expect_error("@{x = ", ErrorKind::Parse);
}

#[test]
fn unknown_markup_is_a_parse_error() {
    expect_error("@&", ErrorKind::Parse);
}

// === DIVERSIONS ===

#[test]
fn diversion_round_trip_plays_once_then_purges() {
    expect(
        "@{atmark.start_diversion(\"D\")}hidden@{atmark.stop_diverting()}visible@{atmark.play_diversion(\"D\")}",
        "visiblehidden",
    );
    expect_error(
        "@{atmark.start_diversion(\"D\")}x@{atmark.stop_diverting()}@{atmark.play_diversion(\"D\")}@{atmark.play_diversion(\"D\")}",
        ErrorKind::Diversion,
    );
}

#[test]
fn replay_keeps_the_diversion_alive() {
    expect(
        "@{atmark.start_diversion(\"D\")}x@{atmark.stop_diverting()}@{atmark.replay_diversion(\"D\")}@{atmark.replay_diversion(\"D\")}@{atmark.purge_diversion(\"D\")}",
        "xx",
    );
}

#[test]
fn play_all_emits_in_name_sorted_order() {
    expect(
        "@{atmark.start_diversion(\"b\")}B@{atmark.start_diversion(\"a\")}A@{atmark.start_diversion(\"c\")}C@{atmark.stop_diverting()}@{atmark.play_all_diversions()}",
        "ABC",
    );
}

#[test]
fn pending_diversions_replay_at_shutdown() {
    expect("@{atmark.start_diversion(\"z\")}tail", "tail");
}

#[test]
fn diverted_writes_are_invisible_until_undiverted() {
    let (mut interp, handle) = build_interp();
    interp
        .process_string(
            "@{atmark.start_diversion(\"d\")}hidden@{atmark.stop_diverting()}seen",
            "<div>",
            None,
        )
        .expect("diversion should process");
    assert_eq!(handle.borrow().as_str(), "seen");
    interp.shutdown().expect("shutdown should succeed");
    assert_eq!(handle.borrow().as_str(), "seenhidden");
}

// === FILTERS ===

#[test]
fn null_filter_discards_everything() {
    expect("a@{atmark.null_filter()}b@{atmark.reset_filter()}c", "ac");
}

#[test]
fn maximal_buffering_releases_only_on_close() {
    let (mut interp, handle) = build_interp();
    interp
        .process_string("@{atmark.set_filter(\"maximal\")}abc@{atmark.flush()}", "<max>", None)
        .expect("filtered template should process");
    assert_eq!(handle.borrow().as_str(), "");
    interp.shutdown().expect("shutdown should succeed");
    assert_eq!(handle.borrow().as_str(), "abc");
}

#[test]
fn line_buffering_releases_whole_lines() {
    let (mut interp, handle) = build_interp();
    interp
        .process_string("@{atmark.set_filter(\"line\")}ab\ncd", "<line>", None)
        .expect("filtered template should process");
    assert_eq!(handle.borrow().as_str(), "ab\n");
    interp.shutdown().expect("shutdown should succeed");
    assert_eq!(handle.borrow().as_str(), "ab\ncd");
}

#[test]
fn size_buffering_rechunks_output() {
    let (mut interp, handle) = build_interp();
    interp
        .process_string("@{atmark.set_filter([\"size\", 2])}abcde", "<size>", None)
        .expect("filtered template should process");
    assert_eq!(handle.borrow().as_str(), "abcd");
    interp.shutdown().expect("shutdown should succeed");
    assert_eq!(handle.borrow().as_str(), "abcde");
}

#[test]
fn translation_tables_map_characters() {
    let (mut interp, handle) = build_interp();
    let table: String = (0u32..256)
        .map(|code| {
            let c = char::from_u32(code).unwrap_or(' ');
            if c == 'a' {
                'z'
            } else {
                c
            }
        })
        .collect();
    interp
        .globals_mut()
        .insert("table".to_string(), Value::String(table));
    interp
        .process_string("@{atmark.set_filter(table)}banana", "<tr>", None)
        .expect("filtered template should process");
    interp.shutdown().expect("shutdown should succeed");
    assert_eq!(handle.borrow().as_str(), "bznznz");
}

#[test]
fn malformed_translation_tables_fail_loudly() {
    assert!(TranslateStage::new("too short").is_err());
    expect_error("@{atmark.set_filter(\"abc\")}", ErrorKind::Filter);
}

#[test]
fn function_filters_transform_from_the_host_side() {
    let (mut interp, handle) = build_interp();
    interp
        .stream_mut()
        .expect("stream should exist")
        .install(vec![Box::new(FunctionStage::new(Box::new(|data: &str| {
            data.to_uppercase()
        })))])
        .expect("install should succeed");
    interp
        .process_string("quiet", "<fn>", None)
        .expect("template should process");
    interp.shutdown().expect("shutdown should succeed");
    assert_eq!(handle.borrow().as_str(), "QUIET");
}

// === PSEUDO-MODULE OPERATIONS ===

#[test]
fn expand_runs_against_a_private_stream() {
    expect("@(atmark.expand(\"@(2 + 2)\"))", "4");
    expect("x@(atmark.expand(\"@[for i in [1,2]]@i@[end for]\"))y", "x12y");
}

#[test]
fn one_shot_expansion_uses_a_dedicated_interpreter() {
    let result = atmark::expand_string("@(2 + 2)", None).expect("expansion should succeed");
    assert_eq!(result, "4");
}

#[test]
fn quote_doubles_prefixes_so_expansion_reproduces() {
    expect("@(atmark.quote(\"a@b\"))", "a@@b");
}

#[test]
fn escape_renders_nonprintables_as_markup_escapes() {
    expect("@(atmark.escape(\"\\n\"))", "@\\n");
    expect("@(atmark.escape(\"\\x07\"))", "@\\a");
}

#[test]
fn prefix_can_be_changed_between_sources() {
    let (mut interp, handle) = build_interp();
    interp
        .process_string("@{atmark.set_prefix(\"$\")}", "<p1>", None)
        .expect("prefix change should process");
    interp
        .process_string("${y = 7}$y and @y", "<p2>", None)
        .expect("dollar template should process");
    interp.shutdown().expect("shutdown should succeed");
    assert_eq!(handle.borrow().as_str(), "7 and @y");
}

#[test]
fn pseudo_module_name_collision_is_fatal() {
    let mut globals = atmark::Bindings::new();
    globals.insert("atmark".to_string(), Value::Int(1));
    let sink = StringSink::new();
    let result = Interpreter::with_config(
        Box::new(sink),
        '@',
        None,
        Options {
            exit_on_error: false,
            ..Options::default()
        },
        Some(globals),
    );
    match result {
        Ok(_) => panic!("collision should be fatal"),
        Err(error) => assert_eq!(error.kind, ErrorKind::Setup),
    }
}

#[test]
fn unknown_pseudo_methods_are_runtime_errors() {
    expect_error("@(atmark.frobnicate())", ErrorKind::Runtime);
}

#[test]
fn at_exit_callables_run_in_reverse_order_at_shutdown() {
    expect(
        "@[def a]A@[end def]@[def b]B@[end def]@{atmark.at_exit(a)}@{atmark.at_exit(b)}main",
        "mainBA",
    );
}

// === HOOKS ===

#[test]
fn hooks_observe_evaluations() {
    let (mut interp, _handle) = build_interp();
    let count = Rc::new(RefCell::new(0usize));
    let seen = Rc::clone(&count);
    interp
        .add_hook("before_evaluate", Box::new(move |_event| {
            *seen.borrow_mut() += 1;
        }))
        .expect("hook registration should succeed");
    interp
        .process_string("@(1 + 1)@(2 + 2)", "<hooks>", None)
        .expect("template should process");
    assert_eq!(*count.borrow(), 2);
}

#[test]
fn hook_registry_validates_names_and_removal() {
    let (mut interp, _handle) = build_interp();
    let error = interp
        .add_hook("no_such_event", Box::new(|_event| {}))
        .expect_err("unknown event should fail");
    assert_eq!(error.kind, ErrorKind::Hook);

    let id = interp
        .add_hook("at_parse", Box::new(|_event| {}))
        .expect("registration should succeed");
    interp
        .remove_hook("at_parse", id)
        .expect("removal should succeed");
    let error = interp
        .remove_hook("at_parse", id)
        .expect_err("double removal should fail");
    assert_eq!(error.kind, ErrorKind::Hook);
}

#[test]
fn templates_can_toggle_and_invoke_hooks() {
    let (mut interp, _handle) = build_interp();
    let count = Rc::new(RefCell::new(0usize));
    let seen = Rc::clone(&count);
    interp
        .add_hook("at_quote", Box::new(move |_event| {
            *seen.borrow_mut() += 1;
        }))
        .expect("hook registration should succeed");
    interp
        .process_string(
            "@{atmark.invoke_hook(\"at_quote\")}@{atmark.disable_hooks()}@{atmark.invoke_hook(\"at_quote\")}",
            "<toggle>",
            None,
        )
        .expect("template should process");
    assert_eq!(*count.borrow(), 1);
}

// === INCLUDES ===

#[test]
fn include_processes_a_nested_file() {
    let path = std::env::temp_dir().join("atmark_include_test.atm");
    std::fs::write(&path, "included @(1 + 1)\n").expect("temp file should write");
    let template = format!("@{{atmark.include(\"{}\")}}after", path.display());
    expect(&template, "included 2\nafter");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn missing_includes_are_io_errors() {
    expect_error(
        "@{atmark.include(\"/nonexistent/atmark/path.atm\")}",
        ErrorKind::Io,
    );
}

// === SIGNIFICATOR HARVESTING ===

#[test]
fn processor_harvests_significators_without_expanding() {
    let dir = std::env::temp_dir().join("atmark_processor_test");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("temp dir should create");
    std::fs::write(
        dir.join("project.atm"),
        "@%requires 2\n@%title \"demo\"\nbody @(never evaluated\n",
    )
    .expect("temp file should write");
    std::fs::write(dir.join("ignored.txt"), "@%skipped 1\n").expect("temp file should write");

    let mut processor = Processor::with_default_prefix().expect("processor should build");
    processor
        .scan(&dir, &[".atm"])
        .expect("scan should succeed");
    let documents = processor.documents();
    assert_eq!(documents.len(), 1);
    let document = documents.get("project.atm").expect("document should exist");
    assert_eq!(document.significators.get("requires"), Some(&Value::Int(2)));
    assert_eq!(
        document.significators.get("title"),
        Some(&Value::String("demo".to_string()))
    );
    let _ = std::fs::remove_dir_all(&dir);
}

// === INCREMENTAL FEEDING ===

const CHUNK_TEMPLATES: &[&str] = &[
    "plain text with no markup\n",
    "a@@b @(1 + 2) c\n",
    "@[for x in [1, 2, 3]]@x;@[end for]\n",
    "@{total = 0}@[for n in range(5)]@{total = total + n}@[end for]@total\n",
    "@(\"a?b\" ? \"yes\" ! \"no\") and @\"literal\"\n",
    "héllo @((1 + 2) * 3) wörld ✓\n",
    "@[if true]@[if false]X@[end if]Y@[end if]\n",
    "@# comment\n@%version 3\nrest\n",
];

#[test]
fn one_byte_chunks_match_whole_string_processing() {
    for template in CHUNK_TEMPLATES {
        let whole = expand(template).expect("whole expansion should succeed");
        let chunked = expand_chunked(template, 1).expect("chunked expansion should succeed");
        assert_eq!(chunked, whole, "template: {:?}", template);
    }
}

mod chunking {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn any_chunk_size_matches_whole_processing(
            index in 0usize..CHUNK_TEMPLATES.len(),
            chunk_size in 1usize..16,
        ) {
            let template = CHUNK_TEMPLATES[index];
            let whole = expand(template).expect("whole expansion should succeed");
            let chunked =
                expand_chunked(template, chunk_size).expect("chunked expansion should succeed");
            prop_assert_eq!(chunked, whole);
        }
    }
}
