use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{distributions::Alphanumeric, rngs::StdRng, Rng, SeedableRng};
use wikihistory::revision_parser::{parse_fragment, TextMode};

fn generate_fragment(text_length: u64) -> Vec<u8> {
    // generate inputs from fixed seeds
    let mut rng = StdRng::seed_from_u64(text_length);
    let mut text = String::new();
    for _ in 0..text_length {
        text.push(rng.sample(Alphanumeric) as char);
    }

    // add some markup at random places, escaped together with the rest below
    const VALUES: &[&str] = &["<ref>", "</ref>", "&", "\n\n", "[[", "]]", "{{", "}}", " "];
    for _ in 0..(text_length / 10) {
        let pos = rng.gen_range(0..text.len());
        let value = VALUES[rng.gen_range(0..VALUES.len())];
        text.insert_str(pos, value);
    }

    let bytes = text.len();
    let text = quick_xml::escape::escape(&text);
    format!(
        "<revision>\n\
         <id>{id}</id>\n\
         <parentid>{parent}</parentid>\n\
         <timestamp>2021-03-15T12:34:56Z</timestamp>\n\
         <contributor><username>Editor</username><id>42</id></contributor>\n\
         <comment>copyedit</comment>\n\
         <model>wikitext</model>\n\
         <format>text/x-wiki</format>\n\
         <text bytes=\"{bytes}\" xml:space=\"preserve\">{text}</text>\n\
         <sha1>phoiac9h4m842xq45sp7s6u21eteeq1</sha1>\n\
         </revision>",
        id = text_length + 1,
        parent = text_length,
        bytes = bytes,
        text = text,
    )
    .into_bytes()
}

fn bench_parse_fragment(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_fragment");
    for length in [500u64, 5000u64, 50000u64, 500000u64].into_iter() {
        let input = generate_fragment(length);
        assert!(
            parse_fragment(&input, TextMode::Full).is_ok(),
            "generated fragment must be valid"
        );
        group.bench_with_input(BenchmarkId::new("LengthOnly", length), &input, |b, i| {
            b.iter(|| parse_fragment(i, TextMode::LengthOnly));
        });
        group.bench_with_input(BenchmarkId::new("Full", length), &input, |b, i| {
            b.iter(|| parse_fragment(i, TextMode::Full));
        });
    }
}

criterion_group!(benches, bench_parse_fragment);
criterion_main!(benches);
