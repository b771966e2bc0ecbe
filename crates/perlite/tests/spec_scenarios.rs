//! End-to-end acceptance scenarios: the cross-subsystem behaviors that are
//! easiest to get subtly wrong (shared cells through eval, list-assignment
//! context, pack slash defaults, the large-block refactorer).

use perlite::{CollectStringPrint, CompileOptions, Interp, PerliteError};

fn run_with(options: CompileOptions, src: &str) -> String {
    let mut interp = Interp::with_options(options);
    let writer = CollectStringPrint::new();
    let (out, _err) = writer.buffers();
    interp.set_writer(Box::new(writer));
    if let Err(e) = interp.run_source(src, "t.pl") {
        panic!("program failed: {e}");
    }
    let result = out.borrow().clone();
    result
}

fn run_ok(src: &str) -> String {
    run_with(CompileOptions::default(), src)
}

#[test]
fn compound_assignment_through_eval_string() {
    assert_eq!(run_ok("my $x = 10; eval '$x += 5'; print $x;"), "15");
    assert_eq!(run_ok("my $x = 1; eval '$x += 2'; print $x == 3 ? 'ok' : 'bad';"), "ok");
}

#[test]
fn hash_list_assignment_counts_source_elements() {
    let src = "my %h; my $n = (%h = (1, 2, 1, 3, 1, 4, 1, 5)); print $n;";
    assert_eq!(run_ok(src), "8");
    // Duplicate keys collapse in the hash itself.
    let src = "my %h; my $n = (%h = (1, 2, 1, 3)); my @kv = %h; print \"$n:@kv\";";
    assert_eq!(run_ok(src), "4:1 3");
}

#[test]
fn pack_slash_with_default_count() {
    let src = "my $r = pack('N/S', 1, 2, 3); print unpack('H*', $r);";
    assert_eq!(run_ok(src), "00000003010002000300");
}

#[test]
fn pack_w_raw_byte() {
    assert_eq!(run_ok("print unpack('H*', pack('C0 W', 253));"), "fd");
}

#[test]
fn regex_comment_then_quantifier() {
    assert_eq!(run_ok("print(('aaac' =~ /^a(?#xxx){3}c/) ? 'y' : 'n');"), "y");
}

#[test]
fn large_block_auto_refactor() {
    let mut src = String::from("my $x = 0;\n");
    for _ in 0..10_000 {
        src.push_str("$x += 1;\n");
    }
    src.push_str("print $x;\n");
    let options = CompileOptions { large_code_refactor: true, ..CompileOptions::default() };
    assert_eq!(run_with(options, &src), "10000");
}

#[test]
fn large_block_without_refactor_is_a_compile_error() {
    let mut src = String::from("my $x = 0;\n");
    for _ in 0..10_000 {
        src.push_str("$x += 1;\n");
    }
    src.push_str("print $x;\n");
    let mut interp = Interp::with_options(CompileOptions::default());
    let err = interp.run_source(&src, "t.pl").unwrap_err();
    match err {
        PerliteError::Compile(diags) => {
            assert!(diags[0].message.contains("too large"), "unexpected: {}", diags[0].message);
        }
        other => panic!("expected compile error, got {other}"),
    }
}

#[test]
fn huge_range_is_rejected_not_materialized() {
    let mut interp = Interp::new();
    let err = interp.run_source("my @r = (1 .. 2147483648); print scalar @r;", "t.pl").unwrap_err();
    let text = format!("{err}");
    assert!(text.contains("Out of memory"), "unexpected: {text}");
}

#[test]
fn string_range_stops_at_length_boundary() {
    assert_eq!(run_ok("my @r = ('a' .. \"\\xFF\"); print scalar @r;"), "26");
}

#[test]
fn foreach_range_is_constant_space() {
    // A range far too large to materialize still iterates (and exits early).
    let src = "my $n = 0; for my $i (1 .. 100_000_000) { $n += 1; last if $n >= 5 } print $n;";
    assert_eq!(run_ok(src), "5");
}

#[test]
fn captureless_list_match_is_one() {
    assert_eq!(run_ok("my @m = ('aaa' =~ /a+/); print scalar(@m), $m[0];"), "11");
}

#[test]
fn closure_cells_are_shared_not_copied() {
    let src = r"
my $total = 0;
my @adders;
for my $i (1..3) {
    push @adders, sub { $total += $i };
}
$_->() for @adders;
print $total;";
    assert_eq!(run_ok(src), "6");
}

#[test]
fn sig_die_handler_sees_the_raise() {
    let src = "my $seen = ''; $SIG{__DIE__} = sub { $seen = $_[0] }; eval { die \"zap\\n\" }; print $seen;";
    assert_eq!(run_ok(src), "zap\n");
}

#[test]
fn handlers_installed_in_eval_string_stay() {
    let src = "eval '$SIG{__WARN__} = sub { print \"IN:\" . $_[0] }'; warn \"w\\n\";";
    assert_eq!(run_ok(src), "IN:w\n");
}

#[test]
fn pack_checksum_of_empty_is_zero() {
    assert_eq!(run_ok("print unpack('%16C*', '');"), "0");
}
