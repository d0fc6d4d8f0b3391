fn main() {
    println!("somfilt - SOM-based variant quality filtering");
    println!();
    println!("The pipeline runs in two steps:");
    println!("  som_eval      - Train the map, score all sites, sweep thresholds");
    println!("                  (annotation table -> .n, .sites.gz, .tab)");
    println!("  som_apply     - Stamp PASS/FailSOM and FiltScore onto a VCF");
    println!("                  (VCF + sites files + cutoffs -> annotated VCF)");
    println!();
    println!("For help with each tool:");
    println!("  cargo run --bin som_eval -- --help");
    println!("  cargo run --bin som_apply -- --help");
    println!();
    println!("Quick start example:");
    println!("  som_eval annots.tab.gz -p snps -t SNP -a QUAL,DP,MQ");
    println!("  som_eval annots.tab.gz -p indels -t INDEL -F ref.fa");
    println!("  som_apply calls.vcf.gz -u \\");
    println!("      -s 1.05e-2 --snp-sites snps.sites.gz \\");
    println!("      -i 5.01e-4 --indel-sites indels.sites.gz > filtered.vcf");
}
