//! Regex matching, substitution, transliteration, and split.

use perlite::{CollectStringPrint, Interp};

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
fn basic_match_and_captures() {
    assert_eq!(run_ok("print 'hello' =~ /ell/ ? 'y' : 'n';"), "y");
    assert_eq!(run_ok("print 'hello' =~ /xyz/ ? 'y' : 'n';"), "n");
    assert_eq!(run_ok("print 'hello' !~ /xyz/ ? 'y' : 'n';"), "y");
    assert_eq!(run_ok("my ($k, $v) = 'key=42' =~ /(\\w+)=(\\d+)/; print \"$k:$v\";"), "key:42");
    assert_eq!(run_ok("'xabcy' =~ /a(b)c/; print \"$&:$1:$`:$'\";"), "abc:b:x:y");
}

#[test]
fn captureless_list_match_yields_one() {
    let src = "my @m = ('abc' =~ /b/); print scalar(@m), ':', $m[0];";
    assert_eq!(run_ok(src), "1:1");
    let src = "my @m = ('abc' =~ /q/); print scalar(@m);";
    assert_eq!(run_ok(src), "0");
}

#[test]
fn match_on_default_variable() {
    assert_eq!(run_ok("$_ = 'abc'; print /b/ ? 'y' : 'n';"), "y");
}

#[test]
fn case_insensitive_and_multiline() {
    assert_eq!(run_ok("print 'HELLO' =~ /hello/i ? 'y' : 'n';"), "y");
    assert_eq!(run_ok("print \"a\\nb\" =~ /^b$/m ? 'y' : 'n';"), "y");
    assert_eq!(run_ok("print \"a\\nb\" =~ /a.b/s ? 'y' : 'n';"), "y");
    assert_eq!(run_ok("print 'ab' =~ / a b /x ? 'y' : 'n';"), "y");
}

#[test]
fn global_match_in_scalar_context_iterates() {
    let src = "my $s = 'a1b2c3'; my $total = 0; while ($s =~ /(\\d)/g) { $total += $1 } print $total;";
    assert_eq!(run_ok(src), "6");
}

#[test]
fn global_match_in_list_context_collects() {
    assert_eq!(run_ok("my @d = ('a1b2c3' =~ /\\d/g); print \"@d\";"), "1 2 3");
    assert_eq!(run_ok("my @pairs = ('a=1,b=2' =~ /(\\w)=(\\d)/g); print \"@pairs\";"), "a 1 b 2");
}

#[test]
fn named_captures() {
    let src = "'john 42' =~ /(?<name>\\w+) (?<age>\\d+)/; print $+{name}, ':', $+{age};";
    assert_eq!(run_ok(src), "john:42");
}

#[test]
fn match_position_arrays() {
    let src = "'xxabyy' =~ /(ab)/; print \"$-[0]:$+[0]\";";
    assert_eq!(run_ok(src), "2:4");
}

#[test]
fn substitution_forms() {
    assert_eq!(run_ok("my $s = 'hello world'; $s =~ s/world/perl/; print $s;"), "hello perl");
    assert_eq!(run_ok("my $s = 'aaa'; my $n = ($s =~ s/a/b/g); print \"$n:$s\";"), "3:bbb");
    assert_eq!(run_ok("my $s = 'abc'; my $t = $s =~ s/b/X/r; print \"$s:$t\";"), "abc:aXc");
    assert_eq!(run_ok("my $s = 'a-b'; $s =~ s/(\\w)-(\\w)/$2-$1/; print $s;"), "b-a");
    assert_eq!(run_ok("my $s = 'n=5'; $s =~ s/(\\d+)/$1 * 2/e; print $s;"), "n=10");
    assert_eq!(run_ok("$_ = 'top dog'; s/dog/cat/; print;"), "top cat");
}

#[test]
fn qr_objects_bind() {
    assert_eq!(run_ok("my $re = qr/\\d+/; print 'abc123' =~ $re ? $& : 'no';"), "123");
    let src = "my $re = qr/end$/; my $str = \"the end\"; print $str =~ $re ? 'y' : 'n';";
    assert_eq!(run_ok(src), "y");
    // qr interpolated into a larger pattern.
    assert_eq!(run_ok("my $d = qr/\\d/; print 'x7' =~ /x$d/ ? 'y' : 'n';"), "y");
}

#[test]
fn empty_pattern_reuses_last_successful() {
    let src = "'foo' =~ /o+/; print 'boot' =~ // ? $& : 'no';";
    assert_eq!(run_ok(src), "oo");
}

#[test]
fn comment_groups_vanish_before_quantifiers() {
    assert_eq!(run_ok("print 'aaac' =~ /^a(?#xxx){3}c/ ? 'y' : 'n';"), "y");
    assert_eq!(run_ok("print 'ac' =~ /^a(?#xxx){3}c/ ? 'y' : 'n';"), "n");
}

#[test]
fn hex_brace_then_quantifier() {
    let src = "my $s = \"\\x{100}\\x{100}\"; print $s =~ /(\\x{100}){2}/ ? 'y' : 'n';";
    assert_eq!(run_ok(src), "y");
}

#[test]
fn branch_reset_renumbers() {
    let src = "'b9' =~ /(?|(a)|(b))(\\d)/; print \"$1$2\";";
    assert_eq!(run_ok(src), "b9");
}

#[test]
fn alpha_assertions() {
    assert_eq!(run_ok("print 'foobaz' =~ /foo(*nla:bar)/ ? 'y' : 'n';"), "y");
    assert_eq!(run_ok("print 'foobar' =~ /foo(*nla:bar)/ ? 'y' : 'n';"), "n");
}

#[test]
fn lookaround_and_backrefs() {
    assert_eq!(run_ok("print 'foobar' =~ /foo(?=bar)/ ? 'y' : 'n';"), "y");
    assert_eq!(run_ok("print 'abcabc' =~ /(abc)\\1/ ? 'y' : 'n';"), "y");
    assert_eq!(run_ok("print 'abcabd' =~ /(abc)\\1/ ? 'y' : 'n';"), "n");
}

#[test]
fn control_verbs_are_compile_errors() {
    let mut interp = Interp::new();
    let err = interp.run_source("print 'a' =~ /a(*ACCEPT)/;", "t.pl").unwrap_err();
    let text = format!("{err}");
    assert!(text.contains("not implemented"), "unexpected: {text}");
}

#[test]
fn interpolated_patterns() {
    let src = "my $word = 'cat'; print 'concatenate' =~ /$word/ ? 'y' : 'n';";
    assert_eq!(run_ok(src), "y");
}

#[test]
fn pos_tracks_global_matches() {
    let src = "my $s = 'aXbX'; $s =~ /X/g; print pos($s);";
    assert_eq!(run_ok(src), "2");
}

#[test]
fn transliteration() {
    assert_eq!(run_ok("my $s = 'hello'; my $n = ($s =~ tr/a-z/A-Z/); print \"$n:$s\";"), "5:HELLO");
    assert_eq!(run_ok("my $s = 'banana'; my $n = ($s =~ tr/a//); print \"$n:$s\";"), "3:banana");
    assert_eq!(run_ok("my $s = 'aabbcc'; $s =~ tr/a-z//s; print $s;"), "abc");
    assert_eq!(run_ok("my $s = 'ab12'; $s =~ tr/0-9//d; print $s;"), "ab");
    assert_eq!(run_ok("my $s = 'abc'; my $t = $s =~ tr/abc/xyz/r; print \"$s:$t\";"), "abc:xyz");
    assert_eq!(run_ok("$_ = 'feet'; tr/e/o/; print;"), "foot");
}

#[test]
fn ambiguous_tr_range_is_rejected() {
    let mut interp = Interp::new();
    let err = interp.run_source("my $s = 'x'; $s =~ tr/a-z-A/x/;", "t.pl").unwrap_err();
    let text = format!("{err}");
    assert!(text.contains("Ambiguous range"), "unexpected: {text}");
}

#[test]
fn split_forms() {
    assert_eq!(run_ok("print join('|', split(/,/, 'a,b,,c'));"), "a|b||c");
    assert_eq!(run_ok("print join('|', split(/,/, 'a,b,c', 2));"), "a|b,c");
    assert_eq!(run_ok("print join('|', split(//, 'abc'));"), "a|b|c");
    assert_eq!(run_ok("print join('|', split(' ', '  a  b c '));"), "a|b|c");
    assert_eq!(run_ok("print scalar(my @f = split(/,/, 'a,b,,,'));"), "2");
    // Captures interleave into the field list.
    assert_eq!(run_ok("print join('|', split(/([,;])/, 'a,b;c'));"), "a|,|b|;|c");
}

#[test]
fn subst_negated_with_r_is_rejected() {
    let mut interp = Interp::new();
    let err = interp.run_source("my $s = 'a'; $s !~ s/a/b/r;", "t.pl").unwrap_err();
    let text = format!("{err}");
    assert!(text.contains("doesn't make sense"), "unexpected: {text}");
}
