use std::io::Write as _;
use std::process::{Command, Output, Stdio};

fn katalyn() -> Command {
    Command::new(env!("CARGO_BIN_EXE_katalyn"))
}

/// Writes `src` to a temp file and runs it.
fn run_source(src: &str) -> Output {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.kat");
    std::fs::write(&path, src).unwrap();
    katalyn().arg(&path).output().expect("failed to run katalyn")
}

fn stdout_of(src: &str) -> String {
    let out = run_source(src);
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn failure_of(src: &str) -> String {
    let out = run_source(src);
    assert!(!out.status.success(), "program unexpectedly succeeded");
    String::from_utf8_lossy(&out.stderr).into_owned()
}

#[test]
fn precedence_follows_the_operator_table() {
    assert_eq!(stdout_of("print(2 + 3 * 4);"), "14\n");
    assert_eq!(stdout_of("print((2 + 3) * 4);"), "20\n");
    assert_eq!(stdout_of("print(10 - 4 - 3);"), "3\n");
}

#[test]
fn table_assignment_round_trips_and_missing_keys_are_nil() {
    let src = "$t: table;\n\
               $t[\"a\"]: 1;\n\
               print($t[\"a\"]);\n\
               print(is_nil($t[\"b\"]));";
    assert_eq!(stdout_of(src), "1\n1\n");
}

#[test]
fn tables_alias_by_reference() {
    let src = "$a: table;\n\
               $b: $a;\n\
               $b[\"k\"]: 42;\n\
               print($a[\"k\"]);";
    assert_eq!(stdout_of(src), "42\n");
}

#[test]
fn nested_table_assignment_navigates_intermediate_tables() {
    let src = "$t: table;\n\
               $t[\"in\"]: table;\n\
               $t[\"in\"][\"x\"]: 7;\n\
               print($t[\"in\"][\"x\"]);";
    assert_eq!(stdout_of(src), "7\n");
}

#[test]
fn functions_read_their_packed_arguments() {
    let src = "def inc;\n\
               return $_[1] + 1;\n\
               ok;\n\
               print(inc(5));";
    assert_eq!(stdout_of(src), "6\n");
}

#[test]
fn forward_referenced_functions_resolve() {
    let src = "print(inc(5));\n\
               def inc;\n\
               return $_[1] + 1;\n\
               ok;";
    assert_eq!(stdout_of(src), "6\n");
}

#[test]
fn calling_an_undefined_function_fails_at_compile_time() {
    let stderr = failure_of("boom(1);");
    assert!(stderr.contains("boom"), "stderr: {stderr}");
}

#[test]
fn function_without_return_yields_nil() {
    let src = "def noop;\n\
               $x: 1;\n\
               ok;\n\
               print(is_nil(noop()));";
    assert_eq!(stdout_of(src), "1\n");
}

#[test]
fn while_loop_counts_up_and_stops() {
    let src = "$i: 0;\n\
               while $i < 3;\n\
               print($i);\n\
               $i: $i + 1;\n\
               ok;";
    assert_eq!(stdout_of(src), "0\n1\n2\n");
}

#[test]
fn continue_skips_to_the_condition_recheck() {
    let src = "$i: 0;\n\
               while $i < 5;\n\
               $i: $i + 1;\n\
               if $i = 3;\n\
               continue;\n\
               ok;\n\
               printc($i);\n\
               ok;";
    assert_eq!(stdout_of(src), "1245");
}

#[test]
fn break_two_exits_both_nested_loops() {
    let src = "$i: 0;\n\
               while 1;\n\
               while 1;\n\
               break 2;\n\
               ok;\n\
               $i: 99;\n\
               ok;\n\
               print($i);";
    assert_eq!(stdout_of(src), "0\n");
}

#[test]
fn until_runs_while_the_condition_is_false() {
    let src = "$i: 0;\n\
               until $i = 3;\n\
               $i: $i + 1;\n\
               ok;\n\
               printc($i);";
    assert_eq!(stdout_of(src), "3");
}

#[test]
fn unless_runs_on_a_false_condition() {
    let src = "unless 0;\n\
               printc(\"ran\");\n\
               ok;\n\
               unless 1;\n\
               printc(\"skipped\");\n\
               ok;";
    assert_eq!(stdout_of(src), "ran");
}

#[test]
fn if_elif_else_takes_exactly_one_branch() {
    let src = "$x: 2;\n\
               if $x = 1;\n\
               printc(\"one\");\n\
               elif $x = 2;\n\
               printc(\"two\");\n\
               else;\n\
               printc(\"many\");\n\
               ok;";
    assert_eq!(stdout_of(src), "two");
    let fallthrough = "$x: 9;\n\
                       if $x = 1;\n\
                       printc(\"one\");\n\
                       elif $x = 2;\n\
                       printc(\"two\");\n\
                       else;\n\
                       printc(\"many\");\n\
                       ok;";
    assert_eq!(stdout_of(fallthrough), "many");
}

#[test]
fn function_locals_are_invisible_outside_but_globals_reach_in() {
    let src = "$g: 10;\n\
               def f;\n\
               $local: 1;\n\
               return $g + $local;\n\
               ok;\n\
               print(f());";
    assert_eq!(stdout_of(src), "11\n");
    let stderr = failure_of("def f;\n$local: 1;\nok;\n$x: $local;");
    assert!(stderr.contains("$local"), "stderr: {stderr}");
}

#[test]
fn global_assignment_from_a_function_body_is_visible_outside() {
    let src = "def setg;\n\
               global $gv: 5;\n\
               ok;\n\
               setg();\n\
               print($gv);";
    assert_eq!(stdout_of(src), "5\n");
}

#[test]
fn undeclared_variable_read_names_the_variable_and_line() {
    let stderr = failure_of("$a: 1;\n$x: $y + 1;");
    assert!(stderr.contains("$y"), "stderr: {stderr}");
    assert!(stderr.contains("line 2"), "stderr: {stderr}");
}

#[test]
fn unsafe_passes_unresolved_reads_through() {
    assert_eq!(stdout_of("unsafe print(is_nil($ghost));"), "1\n");
}

#[test]
fn string_builtins_and_indexing() {
    assert_eq!(stdout_of("print(len(\"hello\"));"), "5\n");
    assert_eq!(stdout_of("printc(substr(\"katalyn\", 2, 3));"), "ata");
    assert_eq!(stdout_of("printc(\"a\" & \"b\");"), "ab");
    assert_eq!(stdout_of("printc(trim(\"  x  \"));"), "x");
    let src = "$s: \"hello\";\nprintc($s[1], $s[-1]);";
    assert_eq!(stdout_of(src), "ho");
}

#[test]
fn array_literals_are_one_indexed() {
    let src = "$a: [10, 20, 30];\n\
               print($a[1], \" \", $a[3], \" \", len($a));";
    assert_eq!(stdout_of(src), "10 20 30 3\n");
}

#[test]
fn iteration_walks_keys_in_insertion_order() {
    let src = "$t: table;\n\
               $t[\"x\"]: 1;\n\
               $t[\"y\"]: 2;\n\
               $it: iter($t);\n\
               $k: next($it);\n\
               while !is_nil($k);\n\
               printc($k);\n\
               $k: next($it);\n\
               ok;";
    assert_eq!(stdout_of(src), "xy");
}

#[test]
fn del_and_is_manage_table_keys() {
    let src = "$t: table;\n\
               $t[\"k\"]: 1;\n\
               printc(is($t, \"k\"));\n\
               del($t, \"k\");\n\
               printc(is($t, \"k\"));";
    assert_eq!(stdout_of(src), "10");
}

#[test]
fn membership_checks_keys_and_substrings() {
    let src = "$t: table;\n\
               $t[\"k\"]: 1;\n\
               printc(\"k\" :: $t, \"ell\" :: \"hello\", \"z\" :: \"hello\");";
    assert_eq!(stdout_of(src), "110");
}

#[test]
fn accept_reads_a_line_from_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.kat");
    std::fs::write(&path, "$name: accept();\nprint(\"hi \", $name);").unwrap();
    let mut child = katalyn()
        .arg(&path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("failed to spawn katalyn");
    child.stdin.as_mut().unwrap().write_all(b"bob\n").unwrap();
    let out = child.wait_with_output().unwrap();
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "hi bob\n");
}

#[test]
fn exit_sets_the_process_code() {
    let out = run_source("printc(\"a\");\nexit(7);\nprintc(\"b\");");
    assert_eq!(out.status.code(), Some(7));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "a");
}

#[test]
fn exec_packages_output_error_and_code() {
    let src = "$r: exec(\"printf hi\");\n\
               printc($r[\"output\"], $r[\"code\"]);";
    assert_eq!(stdout_of(src), "hi0");
}

#[test]
fn file_write_and_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data.txt");
    let src = format!(
        "$f: open_ra(\"{path}\");\n\
         write($f, \"hello\\n\");\n\
         close($f);\n\
         printc(read_file(\"{path}\"));",
        path = data.display()
    );
    let main = dir.path().join("main.kat");
    std::fs::write(&main, src).unwrap();
    let out = katalyn().arg(&main).output().unwrap();
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "hello\n");
}

#[test]
fn import_inlines_a_relative_file_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("lib.kat"),
        "def add1;\nreturn $_[1] + 1;\nok;",
    )
    .unwrap();
    let main = dir.path().join("main.kat");
    // The second import is skipped, so `add1` is not a duplicate.
    std::fs::write(
        &main,
        "import \"lib.kat\";\nimport \"lib.kat\";\nprint(add1(4));",
    )
    .unwrap();
    let out = katalyn().arg(&main).output().unwrap();
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "5\n");
}

#[test]
fn emit_nambly_output_runs_identically_as_bytecode() {
    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("main.kat");
    std::fs::write(&main, "print(2 + 3 * 4);").unwrap();
    let emitted = katalyn().arg(&main).arg("--emit-nambly").output().unwrap();
    assert!(emitted.status.success());
    let listing = dir.path().join("main.nambly");
    std::fs::write(&listing, &emitted.stdout).unwrap();
    let run = katalyn().arg(&listing).arg("--bytecode").output().unwrap();
    assert!(run.status.success(), "stderr: {}", String::from_utf8_lossy(&run.stderr));
    assert_eq!(String::from_utf8_lossy(&run.stdout), "14\n");
}

#[test]
fn missing_ok_reports_the_unclosed_opener() {
    let stderr = failure_of("while 1;\nprintc(1);");
    assert!(stderr.contains("while"), "stderr: {stderr}");
    assert!(stderr.contains("ok"), "stderr: {stderr}");
}

#[test]
fn recompiling_produces_the_same_observable_output() {
    let src = "$i: 0;\nwhile $i < 2;\nprintc($i);\n$i: $i + 1;\nok;";
    assert_eq!(stdout_of(src), stdout_of(src));
}
