//! Core language behavior: data structures, references, context, scoping.

use perlite::{CollectStringPrint, Interp};
use pretty_assertions::assert_eq;

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
fn arrays_push_pop_shift_unshift() {
    let src = "my @a = (2, 3); push @a, 4; unshift @a, 1; my $last = pop @a; my $first = shift @a; print join(',', @a), ';', $first, $last;";
    assert_eq!(run_ok(src), "2,3;14");
}

#[test]
fn array_functions() {
    assert_eq!(run_ok("my @a = (1..5); print scalar(@a), ':', $#a;"), "5:4");
    assert_eq!(run_ok("my @a = (3, 1, 2); print join('', sort { $a <=> $b } @a);"), "123");
    assert_eq!(run_ok("my @a = (3, 1, 2); print join('', sort { $b <=> $a } @a);"), "321");
    assert_eq!(run_ok("print join('', sort 'pear', 'apple', 'fig');"), "applefigpear");
    assert_eq!(run_ok("print join(',', reverse 1..4);"), "4,3,2,1");
    assert_eq!(run_ok("print join(',', map { $_ * 2 } grep { $_ % 2 } 1..5);"), "2,6,10");
    assert_eq!(run_ok("my @a = (1..5); print join(',', @a[1, 3]);"), "2,4");
    assert_eq!(run_ok("my @a = (10, 20, 30, 40); my @cut = splice(@a, 1, 2); print \"@cut;@a\";"), "20 30;10 40");
}

#[test]
fn negative_indexing_and_length_assignment() {
    assert_eq!(run_ok("my @a = (1..5); print $a[-1], $a[-5];"), "51");
    assert_eq!(run_ok("my @a = (1..5); $#a = 2; print join(',', @a);"), "1,2,3");
}

#[test]
fn hashes_basics() {
    let src = "my %h = (a => 1, b => 2, c => 3); print join(',', sort keys %h), ';', $h{b};";
    assert_eq!(run_ok(src), "a,b,c;2");
    let src = "my %h = (a => 1); print exists $h{a} ? 'y' : 'n', exists $h{z} ? 'y' : 'n';";
    assert_eq!(run_ok(src), "yn");
    let src = "my %h = (a => 1, b => 2); delete $h{a}; print join(',', keys %h);";
    assert_eq!(run_ok(src), "b");
    let src = "my %h = (x => 5); my @s = @h{'x', 'nope'}; print defined $s[0] ? $s[0] : 'u', defined $s[1] ? $s[1] : 'u';";
    assert_eq!(run_ok(src), "5u");
}

#[test]
fn hash_each_iteration() {
    let src = "my %h = (a => 1, b => 2); my $n = 0; while (my ($k, $v) = each %h) { $n += $v } print $n;";
    assert_eq!(run_ok(src), "3");
}

#[test]
fn duplicate_keys_keep_last() {
    let src = "my %h = (1, 2, 1, 3); my @kv = %h; print \"@kv\";";
    assert_eq!(run_ok(src), "1 3");
}

#[test]
fn references_and_autovivification() {
    assert_eq!(run_ok("my @a = (1, 2); my $r = \\@a; print scalar @$r;"), "2");
    assert_eq!(run_ok("my %h; $h{a}{b} = 5; print $h{a}{b};"), "5");
    assert_eq!(run_ok("my $d; $d->{list}[2] = 'x'; print scalar @{$d->{list}};"), "3");
    assert_eq!(run_ok("my $d = { list => [1, 2, 3] }; print $d->{list}[1];"), "2");
    assert_eq!(run_ok("my $aoa = [[1, 2], [3, 4]]; print $aoa->[1][0];"), "3");
    assert_eq!(run_ok("print ref([]), ref({}), ref(\\1), ref(sub {});"), "ARRAYHASHSCALARCODE");
    assert_eq!(run_ok("my $x = 7; my $r = \\$x; $$r = 9; print $x;"), "9");
    assert_eq!(run_ok("my @a = (1); my $r = \\@a; push @$r, 2; print \"@a\";"), "1 2");
}

#[test]
fn postfix_dereference() {
    assert_eq!(run_ok("my $r = [1, 2, 3]; print join(',', $r->@*);"), "1,2,3");
    assert_eq!(run_ok("my $h = {a => 1}; my %copy = $h->%*; print $copy{a};"), "1");
    assert_eq!(run_ok("my $x = 5; my $r = \\$x; print $r->$*;"), "5");
}

#[test]
fn string_operators() {
    assert_eq!(run_ok("print 'ab' . 'cd';"), "abcd");
    assert_eq!(run_ok("print 'ab' x 3;"), "ababab");
    assert_eq!(run_ok("print join(',', (1, 2) x 2);"), "1,2,1,2");
    assert_eq!(run_ok("print uc('mixed'), lc('MIXED'), ucfirst('low'), lcfirst('UP');"), "MIXEDmixedLowuP");
    assert_eq!(run_ok("print length('héllo');"), "5");
    assert_eq!(run_ok("print index('hello world', 'o'), rindex('hello world', 'o');"), "47");
    assert_eq!(run_ok("print substr('hello', 1, 3);"), "ell");
    assert_eq!(run_ok("my $s = 'hello'; substr($s, 0, 1, 'J'); print $s;"), "Jello");
    assert_eq!(run_ok("print ord('A'), ':', chr(66);"), "65:B");
    assert_eq!(run_ok("print hex('ff'), ':', oct('0755');"), "255:493");
    assert_eq!(run_ok("my $s = \"line\\n\"; chomp $s; print \"[$s]\";"), "[line]");
    assert_eq!(run_ok("print sprintf('%05.2f|%x|%s', 3.14159, 255, 'hi');"), "03.14|ff|hi");
}

#[test]
fn string_increment_is_magic() {
    assert_eq!(run_ok("my $s = 'Az'; $s++; print $s;"), "Ba");
    assert_eq!(run_ok("my $s = 'zz'; $s++; print $s;"), "aaa");
    assert_eq!(run_ok("my $n = 9; $n++; print $n;"), "10");
}

#[test]
fn numeric_string_coercion() {
    assert_eq!(run_ok("print '10' + '32';"), "42");
    assert_eq!(run_ok("print '3 apples' + 0;"), "3");
    assert_eq!(run_ok("print 'abc' + 0;"), "0");
    assert_eq!(run_ok("print '0 but true' + 5;"), "5");
}

#[test]
fn comparison_operators() {
    assert_eq!(run_ok("print 2 <=> 1, 1 <=> 2, 2 <=> 2;"), "1-10");
    assert_eq!(run_ok("print 'b' cmp 'a', 'a' cmp 'b', 'a' cmp 'a';"), "1-10");
    assert_eq!(run_ok("print 10 == 10.0 ? 'y' : 'n';"), "y");
    assert_eq!(run_ok("print '10' eq '10.0' ? 'y' : 'n';"), "n");
}

#[test]
fn logical_operators_return_operands() {
    assert_eq!(run_ok("print 0 || 'fallback';"), "fallback");
    assert_eq!(run_ok("print 'first' && 'second';"), "second");
    assert_eq!(run_ok("my $u; print $u // 'default';"), "default");
    assert_eq!(run_ok("print 0 // 'default';"), "0");
    assert_eq!(run_ok("my $x = 5; $x ||= 9; my $y = 0; $y ||= 9; print $x, $y;"), "59");
    assert_eq!(run_ok("my $u; $u //= 'set'; print $u;"), "set");
    // The RHS must not evaluate when short-circuited.
    assert_eq!(run_ok("my $hits = 0; sub bump { $hits++; 1 } my $v = 1 || bump(); print $hits;"), "0");
}

#[test]
fn ranges() {
    assert_eq!(run_ok("print join(',', 1..5);"), "1,2,3,4,5");
    assert_eq!(run_ok("print join(',', 'a'..'e');"), "a,b,c,d,e");
    assert_eq!(run_ok("my @r = ('a'..\"\\xFF\"); print scalar @r;"), "26");
    assert_eq!(run_ok("print join(',', 'aa'..'ad');"), "aa,ab,ac,ad");
}

#[test]
fn wantarray_reflects_call_context() {
    let src = "sub ctx { return wantarray ? 'list' : 'scalar' } my @a = ctx(); my $s = ctx(); print \"$a[0]:$s\";";
    assert_eq!(run_ok(src), "list:scalar");
}

#[test]
fn list_assignment_shapes() {
    assert_eq!(run_ok("my ($a, $b, $c) = (1, 2); print defined $c ? 'def' : 'undef', \":$a$b\";"), "undef:12");
    assert_eq!(run_ok("my ($first, @rest) = (1, 2, 3); print \"$first;@rest\";"), "1;2 3");
    assert_eq!(run_ok("my ($x, $y) = (10, 20); ($x, $y) = ($y, $x); print \"$x,$y\";"), "20,10");
    assert_eq!(run_ok("my @a; (@a[0, 2]) = ('x', 'z'); print defined $a[1] ? 'd' : 'u', $a[0], $a[2];"), "uxz");
}

#[test]
fn state_variables_persist() {
    let src = "sub counter { state $n = 0; $n += 1; return $n } print counter(), counter(), counter();";
    assert_eq!(run_ok(src), "123");
}

#[test]
fn local_dynamic_scoping() {
    let src = r"
our $g = 'outer';
sub show { print $g }
sub test { local $g = 'inner'; show(); }
test();
show();";
    assert_eq!(run_ok(src), "innerouter");
}

#[test]
fn begin_blocks_run_at_parse_time() {
    assert_eq!(run_ok("BEGIN { sub from_begin { 'B' } } print from_begin();"), "B");
    // A BEGIN-assigned lexical is visible at runtime through the registry.
    assert_eq!(run_ok("my $v; BEGIN { $v = 'set' } print $v;"), "set");
    // Runtime initialization still wins over the BEGIN-time value.
    assert_eq!(run_ok("my $v = 'runtime'; BEGIN { $v = 'begin' } print $v;"), "runtime");
}

#[test]
fn eval_block_catches_die() {
    let src = "my $r = eval { die \"boom\\n\"; 1 }; print defined $r ? 'def' : 'undef', ':', $@;";
    assert_eq!(run_ok(src), "undef:boom\n");
    let src = "my $ok = eval { 42 }; print $ok, ':', length($@) ? 'err' : 'clean';";
    assert_eq!(run_ok(src), "42:clean");
    // Nested evals: the inner catch does not clobber the outer flow.
    let src = "eval { eval { die \"inner\\n\" }; print 'mid:', $@; die \"outer\\n\" }; print 'end:', $@;";
    assert_eq!(run_ok(src), "mid:inner\nend:outer\n");
}

#[test]
fn die_appends_location_once() {
    let src = "eval { die 'oops' }; print $@;";
    let out = run_ok(src);
    assert!(out.starts_with("oops at t.pl line 1."), "unexpected: {out}");
}

#[test]
fn try_catch_feature() {
    let src = "use feature 'try'; my $log = ''; try { die \"x\\n\" } catch ($e) { $log .= \"caught:$e\" } print $log;";
    assert_eq!(run_ok(src), "caught:x\n");
}

#[test]
fn eval_string_compiles_at_runtime() {
    assert_eq!(run_ok("my $r = eval '2 + 3'; print $r;"), "5");
    assert_eq!(run_ok("print eval 'nonsense(' ? 'ok' : 'failed'; print $@ ? ':set' : ':unset';"), "failed:set");
}

#[test]
fn do_block_value() {
    assert_eq!(run_ok("my $v = do { 1; 2; 3 }; print $v;"), "3");
}

#[test]
fn heredocs() {
    let src = "my $w = 'World';\nprint <<\"EOT\";\nHello $w\nEOT\n";
    assert_eq!(run_ok(src), "Hello World\n");
    let src = "print <<'EOT';\nno $interp here\nEOT\n";
    assert_eq!(run_ok(src), "no $interp here\n");
    let src = "print <<~EOT;\n    indented\n    EOT\n";
    assert_eq!(run_ok(src), "indented\n");
}

#[test]
fn qw_lists() {
    assert_eq!(run_ok("print join('-', qw(a b c));"), "a-b-c");
}

#[test]
fn chained_string_functions() {
    assert_eq!(run_ok("print scalar reverse('abc');"), "cba");
    assert_eq!(run_ok("print join(':', split(/,/, 'a,b,c'));"), "a:b:c");
}

#[test]
fn declared_references_alias() {
    let src = "use feature 'declared_refs'; no warnings; my @src = (1, 2, 3); my \\@alias = \\@src; push @alias, 4; print scalar @src;";
    assert_eq!(run_ok(src), "4");
}

#[test]
fn stringified_refs_look_like_perl() {
    let out = run_ok("print [] . '';");
    assert!(out.starts_with("ARRAY(0x"), "unexpected: {out}");
    let out = run_ok("my $h = {}; print \"$h\";");
    assert!(out.starts_with("HASH(0x"), "unexpected: {out}");
}

#[test]
fn caller_reports_sub_name() {
    let src = "sub who { my @c = caller(0); return $c[3] } print who();";
    assert_eq!(run_ok(src), "main::who");
}

#[test]
fn sprintf_star_and_vectors_of_flags() {
    assert_eq!(run_ok("print sprintf('%*d', 5, 42);"), "   42");
    assert_eq!(run_ok("print sprintf('%-6s|', 'ab');"), "ab    |");
    assert_eq!(run_ok("print sprintf('%+d %+d', 3, -3);"), "+3 -3");
}

#[test]
fn unless_else_and_until_modifiers() {
    assert_eq!(run_ok("unless (0) { print 'a' } else { print 'b' }"), "a");
    assert_eq!(run_ok("my $i = 0; $i++ until $i >= 3; print $i;"), "3");
}
