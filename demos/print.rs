fn print_group(file: &hdf5::File, path: &str, group: &hdf5::Group, indent: usize) {
    let pad = "  ".repeat(indent);
    for link in group.links().unwrap_or_default() {
        let child_path = format!("{path}/{}", link.name);
        match link.target {
            hdf5::LinkTarget::Soft => println!("{pad}{} -> (soft link, not followed)", link.name),
            hdf5::LinkTarget::External => {
                println!("{pad}{} -> (external link, not followed)", link.name)
            }
            hdf5::LinkTarget::Hard(_) => match file.get(&child_path) {
                Ok(hdf5::Entry::Group(g)) => {
                    println!("{pad}{}/", link.name);
                    print_group(file, &child_path, &g, indent + 1);
                }
                Ok(hdf5::Entry::Dataset(d)) => {
                    println!("{pad}{} {:?} {:?}", link.name, d.shape(), d.dtype());
                }
                Err(e) => println!("{pad}{} (error: {e})", link.name),
            },
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filename = std::env::args().nth(1).expect("Need a file path to open");
    let file = hdf5::open(&filename)?;
    println!("{filename}:");
    print_group(&file, "", file.root(), 1);
    Ok(())
}
