// graphviz dump of one scheduled task graph

use std::io;

/// Streams a `digraph` to any writer; one record-shaped node per scheduled
/// task, one line per dependency edge.
pub(crate) struct DotWriter<'a, W: io::Write> {
    out: &'a mut W,
}

impl<'a, W: io::Write> DotWriter<'a, W> {
    pub fn new(out: &'a mut W) -> io::Result<DotWriter<'a, W>> {
        writeln!(out, "digraph taskgraph {{")?;
        Ok(DotWriter { out })
    }

    pub fn node(&mut self, id: usize, label: &str) -> io::Result<()> {
        writeln!(self.out, "  task{} [shape=record, label=\"{}\"];", id, label)
    }

    pub fn edge(&mut self, src: usize, dst: usize) -> io::Result<()> {
        writeln!(self.out, "  task{} -> task{};", src, dst)
    }

    pub fn finish(self) -> io::Result<()> {
        writeln!(self.out, "}}")
    }
}
