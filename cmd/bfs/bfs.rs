//! `bfs`: breadth-first `find`-compatible directory search.

mod initializers;

use bfs_expr::ParseError;
use std::process::exit;

fn main() {
    let tokens: Vec<String> = std::env::args().skip(1).collect();
    let mut cmdline = match bfs_expr::parse_cmdline(tokens.clone()) {
        Ok(cmdline) => cmdline,
        Err(error) => {
            render_parse_error(&tokens, &error);
            exit(2);
        }
    };

    initializers::init_tracing(&cmdline.debug);
    initializers::apply_resource_limits(&mut cmdline);

    if cmdline.debug.tree {
        eprintln!(
            "bfs: tree: {}",
            cmdline.arena.dump(cmdline.root, &cmdline.tokens)
        );
    }
    if cmdline.debug.cost {
        let node = cmdline.arena.get(cmdline.root);
        eprintln!(
            "bfs: cost: {:.0}, probability: {:.4}",
            node.cost, node.prob
        );
    }

    exit(bfs_expr::eval::run(cmdline));
}

/// Print the diagnostic with the offending tokens underlined.
fn render_parse_error(tokens: &[String], error: &ParseError) {
    eprintln!("bfs: error: {error}");
    let (from, to) = error.span;
    if from >= tokens.len() {
        return;
    }
    let mut line = String::from("bfs");
    let mut marker = String::from("   ");
    for (index, token) in tokens.iter().enumerate() {
        line.push(' ');
        marker.push(' ');
        line.push_str(token);
        let width = token.chars().count().max(1);
        let mark = if index >= from && index < to { '~' } else { ' ' };
        marker.extend(std::iter::repeat(mark).take(width));
    }
    eprintln!("{line}");
    eprintln!("{marker}");
}
