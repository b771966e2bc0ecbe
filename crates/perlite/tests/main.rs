use perlite::{CollectStringPrint, CompileOptions, Interp, PerliteError};

fn run_ok(src: &str) -> String {
    let mut interp = Interp::new();
    let writer = CollectStringPrint::new();
    let (out, _err) = writer.buffers();
    interp.set_writer(Box::new(writer));
    if let Err(e) = interp.run_source(src, "t.pl") {
        panic!("program failed: {e}\nsource:\n{src}");
    }
    let result = out.borrow().clone();
    result
}

#[test]
fn arithmetic_prints() {
    assert_eq!(run_ok("print 6 * 7;"), "42");
    assert_eq!(run_ok("print 7 / 2;"), "3.5");
    assert_eq!(run_ok("print 10 % 3;"), "1");
    assert_eq!(run_ok("print 2 ** 10;"), "1024");
    assert_eq!(run_ok("print -7 % 3;"), "2");
    assert_eq!(run_ok("print 0.1 + 0.2;"), "0.3");
}

#[test]
fn string_interpolation() {
    assert_eq!(run_ok(r#"my $x = "world"; print "hello $x";"#), "hello world");
    assert_eq!(run_ok(r#"my @a = (1, 2, 3); print "got @a";"#), "got 1 2 3");
    assert_eq!(run_ok(r#"my %h = (k => 'v'); print "-> $h{k}";"#), "-> v");
    assert_eq!(run_ok(r#"print "tab\there";"#), "tab\there");
    assert_eq!(run_ok(r#"print "\x{263A}" eq chr(0x263A) ? 'ok' : 'no';"#), "ok");
}

#[test]
fn repeated_runs_are_independent() {
    for _ in 0..2 {
        assert_eq!(run_ok("my $n = 0; $n += 3; print $n;"), "3");
    }
}

#[test]
fn conditionals_and_loops() {
    assert_eq!(run_ok("if (1) { print 'a' } elsif (2) { print 'b' } else { print 'c' }"), "a");
    assert_eq!(run_ok("if (0) { print 'a' } elsif (2) { print 'b' } else { print 'c' }"), "b");
    assert_eq!(run_ok("print 'neg' unless 1 > 0;"), "");
    let src = "my $total = 0; my $i = 0; while ($i < 5) { $total += $i; $i++; } print $total;";
    assert_eq!(run_ok(src), "10");
    assert_eq!(run_ok("my $s = ''; for (my $i = 0; $i < 3; $i++) { $s .= $i } print $s;"), "012");
    assert_eq!(run_ok("my $s = ''; $s .= $_ for 1..3; print $s;"), "123");
    assert_eq!(run_ok("my $i = 10; until ($i <= 7) { $i--; } print $i;"), "7");
    assert_eq!(run_ok("my $n = 0; do { $n++ } while $n < 3; print $n;"), "3");
}

#[test]
fn foreach_aliases_elements() {
    let src = "my @a = (1, 2, 3); for my $x (@a) { $x *= 10 } print join(',', @a);";
    assert_eq!(run_ok(src), "10,20,30");
    // The default variable aliases too.
    let src = "my @a = (1, 2); $_ += 5 for @a; print \"@a\";";
    assert_eq!(run_ok(src), "6 7");
}

#[test]
fn subs_and_recursion() {
    let src = "sub fact { my $n = shift; return $n <= 1 ? 1 : $n * fact($n - 1); } print fact(6);";
    assert_eq!(run_ok(src), "720");
    let src = "sub greet { my ($who, $mark) = @_; return \"hi $who$mark\"; } print greet('you', '!');";
    assert_eq!(run_ok(src), "hi you!");
}

#[test]
fn implicit_last_expression_return() {
    assert_eq!(run_ok("sub three { 3 } print three();"), "3");
}

#[test]
fn closures_share_cells() {
    let src = "my $c = 0; my $inc = sub { $c += 1 }; $inc->(); $inc->(); print $c;";
    assert_eq!(run_ok(src), "2");
    // Two closures over the same cell observe each other.
    let src = "my $n = 1; my $double = sub { $n *= 2 }; my $get = sub { $n }; $double->(); $double->(); print $get->();";
    assert_eq!(run_ok(src), "4");
}

#[test]
fn labeled_loop_control() {
    let src = r"
OUTER: for my $i (1..3) {
    for my $j (1..3) {
        next OUTER if $j == 2;
        print qq($i$j);
    }
}";
    assert_eq!(run_ok(src), "112131");
    let src = "my $s = ''; for my $i (1..9) { last if $i > 4; next if $i % 2; $s .= $i } print $s;";
    assert_eq!(run_ok(src), "24");
}

#[test]
fn exit_sets_status() {
    let mut interp = Interp::new();
    let writer = CollectStringPrint::new();
    let (out, _) = writer.buffers();
    interp.set_writer(Box::new(writer));
    interp.run_source("print 'before'; exit(3); print 'after';", "t.pl").unwrap();
    assert_eq!(out.borrow().as_str(), "before");
    assert_eq!(interp.exit_status(), Some(3));
}

#[test]
fn argv_is_prepopulated() {
    let options = CompileOptions { argv: vec!["alpha".into(), "beta".into()], ..CompileOptions::default() };
    let mut interp = Interp::with_options(options);
    let writer = CollectStringPrint::new();
    let (out, _) = writer.buffers();
    interp.set_writer(Box::new(writer));
    interp.run_source("print join('+', @ARGV);", "t.pl").unwrap();
    assert_eq!(out.borrow().as_str(), "alpha+beta");
}

#[test]
fn strict_vars_rejects_undeclared() {
    let mut interp = Interp::new();
    let err = interp.run_source("use strict; $x = 1;", "t.pl").unwrap_err();
    match err {
        PerliteError::Compile(diags) => {
            assert!(
                diags[0].message.contains("Global symbol \"$x\" requires explicit package name"),
                "unexpected: {}",
                diags[0].message
            );
        }
        other => panic!("expected compile error, got {other}"),
    }
}

#[test]
fn syntax_errors_carry_positions() {
    let mut interp = Interp::new();
    let err = interp.run_source("my $x = ;", "broken.pl").unwrap_err();
    match err {
        PerliteError::Compile(diags) => {
            assert_eq!(diags[0].file, "broken.pl");
            assert_eq!(diags[0].line, 1);
        }
        other => panic!("expected compile error, got {other}"),
    }
}

#[test]
fn line_directive_adjusts_diagnostics() {
    let src = "#line 500 \"virtual.pl\"\nmy $x = ;";
    let mut interp = Interp::new();
    let err = interp.run_source(src, "real.pl").unwrap_err();
    match err {
        PerliteError::Compile(diags) => {
            assert_eq!(diags[0].file, "virtual.pl");
            assert_eq!(diags[0].line, 500);
        }
        other => panic!("expected compile error, got {other}"),
    }
}

#[test]
fn unhandled_die_surfaces_as_runtime_error() {
    let mut interp = Interp::new();
    let err = interp.run_source("die \"kaput\";", "t.pl").unwrap_err();
    match err {
        PerliteError::Runtime(e) => {
            assert!(e.message.starts_with("kaput at t.pl line 1."), "unexpected: {}", e.message);
        }
        other => panic!("expected runtime error, got {other}"),
    }
}

#[test]
fn end_blocks_run_at_teardown_in_reverse() {
    assert_eq!(run_ok("END { print 'one' } END { print 'two' } print 'main-';"), "main-twoone");
}

#[test]
fn warnings_route_to_stderr() {
    let mut interp = Interp::new();
    let writer = CollectStringPrint::new();
    let (_, err) = writer.buffers();
    interp.set_writer(Box::new(writer));
    interp.run_source("warn \"careful\\n\";", "t.pl").unwrap();
    assert_eq!(err.borrow().as_str(), "careful\n");
}

#[test]
fn sig_warn_handler_intercepts() {
    let src = "$SIG{__WARN__} = sub { print \"W:$_[0]\" }; warn \"hi\\n\"; print 'done';";
    assert_eq!(run_ok(src), "W:hi\ndone");
}
