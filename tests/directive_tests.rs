//! Directive behavior: conditional assembly, %rep looping, contexts,
//! evaluation directives, scopes, includes and the line machinery.

mod common;

use std::collections::HashMap;

use common::{expand, preprocess, preprocess_with};
use mantra::{Pass, Severity};

// ---------------------------------------------------------------------------
// conditional assembly
// ---------------------------------------------------------------------------

#[test]
fn if_true_branch_emits() {
    let src = "%define VER 2\n%if VER >= 2\nok1\n%else\nok2\n%endif";
    assert_eq!(expand(src), ["ok1"]);
}

#[test]
fn if_false_branch_suppresses() {
    let src = "%if 0\nhidden\n%else\nshown\n%endif";
    assert_eq!(expand(src), ["shown"]);
}

#[test]
fn elif_chain_takes_first_true() {
    let src = "\
%define V 2
%if V = 1
one
%elif V = 2
two
%elif V = 2
again
%else
other
%endif";
    assert_eq!(expand(src), ["two"]);
}

#[test]
fn nested_conditionals_balance() {
    let src = "\
%if 1
a
%if 0
b
%else
c
%endif
d
%endif";
    assert_eq!(expand(src), ["a", "c", "d"]);
}

#[test]
fn conditionals_inside_dead_branch_stay_dead() {
    let src = "\
%if 0
%if 1
ghost
%endif
%else
real
%endif";
    assert_eq!(expand(src), ["real"]);
}

#[test]
fn unmatched_endif_is_fatal() {
    let out = preprocess("%endif");
    let fatal = out.fatal.expect("fatal");
    assert!(fatal.message().contains("no matching `%if'"));
}

#[test]
fn unterminated_if_at_eof_is_fatal() {
    let out = preprocess("%if 1\nline");
    let fatal = out.fatal.expect("fatal");
    assert!(fatal.message().contains("%endif"));
}

#[test]
fn diagnostics_in_dead_branch_are_suppressed() {
    let src = "%if 0\n%error \"never seen\"\n%bogus\n%endif\nafter";
    let out = preprocess(src);
    assert!(out.fatal.is_none());
    assert_eq!(out.lines, ["after"]);
    assert!(out.diags.is_empty(), "{:?}", out.diags);
}

#[test]
fn ifdef_tracks_macro_table() {
    let src = "%define SEEN 1\n%ifdef SEEN\nyes\n%endif\n%ifdef MISSING\nno\n%endif";
    assert_eq!(expand(src), ["yes"]);
}

#[test]
fn ifndef_negates() {
    let src = "%ifndef MISSING\nyes\n%endif";
    assert_eq!(expand(src), ["yes"]);
}

#[test]
fn ifidn_is_case_sensitive_ifidni_not() {
    let src = "\
%ifidn 'A','a'
sens
%endif
%ifidni 'A','a'
insens
%endif";
    assert_eq!(expand(src), ["insens"]);
}

#[test]
fn ifidn_ignores_whitespace_and_quote_style() {
    let src = "%ifidn \"x\" + 1, 'x' +1\nsame\n%endif";
    assert_eq!(expand(src), ["same"]);
}

#[test]
fn ifid_ifnum_ifstr_classify_first_token() {
    let src = "\
%ifid hello
id
%endif
%ifnum 42
num
%endif
%ifstr 'q'
str
%endif
%ifnum hello
bad
%endif";
    assert_eq!(expand(src), ["id", "num", "str"]);
}

#[test]
fn ifmacro_is_arity_aware() {
    let src = "\
%macro m 2-3
%endmacro
%ifmacro m 2
two
%endif
%ifmacro m 5
five
%endif
%ifnmacro m 5
notfive
%endif";
    assert_eq!(expand(src), ["two", "notfive"]);
}

#[test]
fn ifctx_compares_top_context() {
    let src = "\
%push proc
%ifctx proc
inproc
%endif
%repl loop
%ifctx proc
stale
%endif
%ifctx loop
inloop
%endif
%pop";
    assert_eq!(expand(src), ["inproc", "inloop"]);
}

#[test]
fn non_constant_if_goes_dead() {
    let out = preprocess("%if bogus\nx\n%else\ny\n%endif\nz");
    assert!(out.fatal.is_none());
    // Evaluation failed: the whole construct is dead, including %else.
    assert_eq!(out.lines, ["z"]);
    assert!(out
        .diags
        .iter()
        .any(|d| d.severity == Severity::NonFatal));
}

// ---------------------------------------------------------------------------
// %rep / %exitrep
// ---------------------------------------------------------------------------

#[test]
fn rep_replays_body() {
    let src = "%rep 3\ninc cx\n%endrep";
    assert_eq!(expand(src), ["inc cx", "inc cx", "inc cx"]);
}

#[test]
fn rep_zero_emits_nothing() {
    assert_eq!(expand("%rep 0\nnever\n%endrep"), Vec::<String>::new());
}

#[test]
fn rep_count_is_an_expression() {
    let src = "%assign N 2\n%rep N * 2\nx\n%endrep";
    assert_eq!(expand(src).len(), 4);
}

#[test]
fn exitrep_stops_iteration() {
    let src = "%rep 4\nkept\n%exitrep\ndropped\n%endrep";
    assert_eq!(expand(src), ["kept"]);
}

#[test]
fn conditional_exitrep_yields_partial_count() {
    let src = "\
%assign n 0
%rep 10
%assign n n+1
%if n > 3
%exitrep
%endif
db n
%endrep";
    assert_eq!(expand(src), ["db 1", "db 2", "db 3"]);
}

#[test]
fn nested_rep_multiplies() {
    let src = "%rep 2\n%rep 3\nx\n%endrep\n%endrep";
    assert_eq!(expand(src).len(), 6);
}

#[test]
fn rep_changes_see_reassigned_macros() {
    let src = "\
%assign k 1
%rep 3
db k
%assign k k+1
%endrep";
    assert_eq!(expand(src), ["db 1", "db 2", "db 3"]);
}

#[test]
fn stray_endrep_is_fatal() {
    let out = preprocess("%endrep");
    assert!(out.fatal.is_some());
}

#[test]
fn stray_exitrep_is_nonfatal() {
    let out = preprocess("%exitrep\nafter");
    assert!(out.fatal.is_none());
    assert_eq!(out.lines, ["after"]);
    assert!(out
        .diags
        .iter()
        .any(|d| d.message.contains("not within `%rep'")));
}

// ---------------------------------------------------------------------------
// evaluation directives
// ---------------------------------------------------------------------------

#[test]
fn assign_evaluates_and_shadows() {
    let src = "%assign x 1+2\ndb x\n%assign x x*2\ndb x";
    assert_eq!(expand(src), ["db 3", "db 6"]);
}

#[test]
fn assign_non_constant_is_nonfatal() {
    let out = preprocess("%assign x undefined_sym\nafter");
    assert!(out.fatal.is_none());
    assert_eq!(out.lines, ["after"]);
    assert!(out
        .diags
        .iter()
        .any(|d| d.message.contains("non-constant value given to `%assign'")));
}

#[test]
fn strlen_defines_length() {
    let src = "%strlen n 'hello'\ndb n";
    assert_eq!(expand(src), ["db 5"]);
}

#[test]
fn substr_picks_one_character() {
    let src = "%substr c 'hello' 2\ndb c";
    assert_eq!(expand(src), ["db 'e'"]);
}

#[test]
fn substr_out_of_range_is_empty() {
    let src = "%substr c 'hi' 9\ndb c";
    assert_eq!(expand(src), ["db ''"]);
}

// ---------------------------------------------------------------------------
// contexts and scopes
// ---------------------------------------------------------------------------

#[test]
fn push_pop_balance() {
    let src = "%push a\n%push b\n%pop\n%pop\ndone";
    assert_eq!(expand(src), ["done"]);
}

#[test]
fn pop_on_empty_stack_is_fatal() {
    let out = preprocess("%pop");
    assert!(out.fatal.is_some());
}

#[test]
fn context_local_defines_die_with_context() {
    let src = "\
%push frame
%define %$size 4
db %$size
%pop
%push frame
%ifdef %$size
leaked
%endif
%pop";
    assert_eq!(expand(src), ["db 4"]);
}

#[test]
fn scope_shadows_and_unwinds() {
    let src = "\
%define v 1
%scope
%define v 2
db v
%endscope
db v";
    assert_eq!(expand(src), ["db 2", "db 1"]);
}

#[test]
fn unbalanced_endscope_is_fatal() {
    assert!(preprocess("%endscope").fatal.is_some());
}

#[test]
fn clear_drops_all_macros() {
    let src = "%define a 1\n%clear\ndb a";
    assert_eq!(expand(src), ["db a"]);
}

// ---------------------------------------------------------------------------
// includes, dependencies, %line, %error
// ---------------------------------------------------------------------------

fn inc_files() -> HashMap<String, String> {
    let mut files = HashMap::new();
    files.insert(
        "consts.inc".to_string(),
        "%define LIMIT 32\n%include \"deep.inc\"".to_string(),
    );
    files.insert("deep.inc".to_string(), "%define DEPTH 2".to_string());
    files
}

#[test]
fn include_pulls_definitions() {
    let out = preprocess_with(
        "%include \"consts.inc\"\ndb LIMIT\ndb DEPTH",
        inc_files(),
        Pass::First,
    );
    assert!(out.fatal.is_none());
    assert_eq!(out.lines, ["db 32", "db 2"]);
}

#[test]
fn dependencies_recorded_in_first_touch_order() {
    let out = preprocess_with(
        "%include \"consts.inc\"\n%include \"consts.inc\"",
        inc_files(),
        Pass::Dependencies,
    );
    assert!(out.fatal.is_none());
    let deps: Vec<String> = out
        .deps
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    assert_eq!(deps, ["consts.inc", "deep.inc"]);
}

#[test]
fn missing_include_is_fatal() {
    let out = preprocess("%include \"nowhere.inc\"");
    let fatal = out.fatal.expect("fatal");
    assert!(fatal.message().contains("unable to open include file"));
}

#[test]
fn line_directive_renumbers() {
    let src = "%line 100 other.asm\ndb __LINE__\ndb __FILE__";
    assert_eq!(expand(src), ["db 101", "db \"other.asm\""]);
}

#[test]
fn cpp_marker_is_translated() {
    let src = "# 50 \"gen.c\"\ndb __LINE__";
    assert_eq!(expand(src), ["db 51"]);
}

#[test]
fn error_directive_reports_expanded_text() {
    let src = "%define WHO world\n%error \"bad WHO\"\nafter";
    let out = preprocess(src);
    assert!(out.fatal.is_none());
    assert_eq!(out.lines, ["after"]);
    assert!(out
        .diags
        .iter()
        .any(|d| d.severity == Severity::NonFatal && d.message.contains("bad world")));
}

// ---------------------------------------------------------------------------
// stack-frame sugar
// ---------------------------------------------------------------------------

#[test]
fn arg_desugars_to_defines() {
    let src = "%stacksize flat\n%arg a:dword, b:word\nmov ax, a\nmov bx, b";
    assert_eq!(expand(src), ["mov ax, (ebp+8)", "mov bx, (ebp+12)"]);
}

#[test]
fn local_desugars_and_grows_localsize() {
    let src = "\
%push proc
%assign %$localsize 0
%local tmp:dword
mov ax, tmp
db %$localsize
%pop";
    assert_eq!(expand(src), ["mov ax, (ebp-4)", "db 4"]);
}

#[test]
fn stacksize_small_changes_layout() {
    let src = "%stacksize small\n%arg a:word\nmov ax, a";
    assert_eq!(expand(src), ["mov ax, (bp+6)"]);
}

// ---------------------------------------------------------------------------
// pass persistence
// ---------------------------------------------------------------------------

#[test]
fn tables_persist_into_final_pass() {
    use mantra::source::MemorySource;
    use mantra::{CollectSink, Collaborators, Preprocessor};

    let sink = CollectSink::new();
    let collab = Collaborators {
        sink: Box::new(sink),
        ..Collaborators::default()
    };
    let mut preproc = Preprocessor::new(collab);
    let src = "%define K 9\ndb K";

    preproc.reset(Box::new(MemorySource::from(src)), "two-pass.asm", Pass::First);
    let mut first = Vec::new();
    while let Ok(Some(line)) = preproc.get_line() {
        first.push(line);
    }
    preproc.cleanup(Pass::First);

    // The final pass replays the source with tables intact; K is already
    // defined when the pass begins.
    preproc.reset(
        Box::new(MemorySource::from("db K")),
        "two-pass.asm",
        Pass::Final,
    );
    let mut second = Vec::new();
    while let Ok(Some(line)) = preproc.get_line() {
        second.push(line);
    }
    assert_eq!(first, ["db 9"]);
    assert_eq!(second, ["db 9"]);
}

#[test]
fn unknown_directive_is_reported_and_line_flows_on() {
    let out = preprocess("%define q 3\n%notreal q");
    assert!(out.fatal.is_none());
    assert!(out
        .diags
        .iter()
        .any(|d| d.message.contains("unknown preprocessor directive")));
    // The line continues through expansion after the diagnostic.
    assert_eq!(out.lines, ["%notreal 3"]);
}
