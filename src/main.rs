fn main() -> anyhow::Result<()> {
    linkshelf::cli::run()
}
