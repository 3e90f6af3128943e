use anyhow::Result;

fn main() -> Result<()> {
    smol::block_on(fproxy::run())
}
